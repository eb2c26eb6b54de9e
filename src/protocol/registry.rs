//! Ordered claim-first protocol registry.

use std::sync::Arc;

use super::Protocol;

/// Holds registered plugins in registration order. The first plugin whose
/// `claim` accepts a chunk wins; order is therefore part of the
/// configuration, and plugins with ambiguous prefixes must be registered
/// most-specific first.
#[derive(Default)]
pub struct ProtocolRegistry {
    plugins: Vec<Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin; later registrations are only consulted when every
    /// earlier plugin declines.
    pub fn register(&mut self, plugin: Arc<dyn Protocol>) {
        self.plugins.push(plugin);
    }

    /// First plugin in registration order that claims `bytes`, if any.
    pub fn claim_first(&self, bytes: &[u8]) -> Option<Arc<dyn Protocol>> {
        self.plugins.iter().find(|p| p.claim(bytes)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameOutcome, GatewayContext, InboundMessage};
    use crate::storage::EventRecord;
    use async_trait::async_trait;

    struct PrefixPlugin {
        name: &'static str,
        prefix: u8,
    }

    #[async_trait]
    impl Protocol for PrefixPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn claim(&self, bytes: &[u8]) -> bool {
            bytes.first() == Some(&self.prefix)
        }

        fn frame(&self, bytes: &[u8]) -> FrameOutcome {
            FrameOutcome::Complete {
                consumed: bytes.len(),
            }
        }

        async fn handle(
            &self,
            _message: &InboundMessage,
            _ctx: &GatewayContext,
        ) -> crate::error::Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_claim_first_respects_registration_order() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(PrefixPlugin {
            name: "first",
            prefix: b'*',
        }));
        registry.register(Arc::new(PrefixPlugin {
            name: "second",
            prefix: b'*',
        }));

        let claimed = registry.claim_first(b"*hello#").unwrap();
        assert_eq!(claimed.name(), "first");
    }

    #[test]
    fn test_unclaimed_chunk_returns_none() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(PrefixPlugin {
            name: "star",
            prefix: b'*',
        }));

        assert!(registry.claim_first(&[0x92, 0x29]).is_none());
    }

    #[test]
    fn test_later_plugin_claims_when_earlier_declines() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(PrefixPlugin {
            name: "star",
            prefix: b'*',
        }));
        registry.register(Arc::new(PrefixPlugin {
            name: "bin",
            prefix: 0x92,
        }));

        let claimed = registry.claim_first(&[0x92, 0x29, 0x21]).unwrap();
        assert_eq!(claimed.name(), "bin");
    }
}
