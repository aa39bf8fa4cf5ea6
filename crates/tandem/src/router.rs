//! Incoming frame routing
//!
//! Decodes each text frame received on the data channel into exactly one
//! typed [`Envelope`]. Unknown types and malformed frames are logged, counted
//! and dropped here so handlers only ever see well-formed messages.

use std::collections::BTreeMap;
use tracing::{trace, warn};

use crate::protocol::{parse_frame, Envelope, FrameError};

/// Routing counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Routed frames per message type
    pub routed: BTreeMap<&'static str, u64>,
    pub unknown: u64,
    pub malformed: u64,
}

impl RouterStats {
    pub fn routed_total(&self) -> u64 {
        self.routed.values().sum()
    }

    pub fn dropped(&self) -> u64 {
        self.unknown + self.malformed
    }
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame; `None` means it was dropped
    pub fn route(&mut self, text: &str) -> Option<Envelope> {
        match parse_frame(text) {
            Ok(envelope) => {
                trace!("[Router] {} frame", envelope.type_name());
                *self.stats.routed.entry(envelope.type_name()).or_insert(0) += 1;
                Some(envelope)
            }
            Err(FrameError::UnknownType(kind)) => {
                warn!("[Router] dropping frame with unknown type '{}'", kind);
                self.stats.unknown += 1;
                None
            }
            Err(FrameError::Malformed(reason)) => {
                warn!("[Router] dropping malformed frame: {}", reason);
                self.stats.malformed += 1;
                None
            }
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_envelope, ChatMessage, FileRef};

    #[test]
    fn test_routes_each_type_once() {
        let mut router = MessageRouter::new();
        let chat = encode_envelope(&Envelope::Chat(ChatMessage::new("hi"))).unwrap();
        let approve = encode_envelope(&Envelope::FileApprove(FileRef {
            file_id: "f1".into(),
        }))
        .unwrap();

        assert!(matches!(router.route(&chat), Some(Envelope::Chat(_))));
        assert!(matches!(
            router.route(&approve),
            Some(Envelope::FileApprove(r)) if r.file_id == "f1"
        ));
        assert_eq!(router.stats().routed["chat"], 1);
        assert_eq!(router.stats().routed["file_approve"], 1);
        assert_eq!(router.stats().routed_total(), 2);
    }

    #[test]
    fn test_drops_unknown_and_malformed() {
        let mut router = MessageRouter::new();
        assert!(router.route(r#"{"type":"typing","payload":{}}"#).is_none());
        assert!(router.route("{").is_none());
        assert!(router
            .route(r#"{"type":"chat","payload":{"text":5}}"#)
            .is_none());

        let stats = router.stats();
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.dropped(), 3);
        assert_eq!(stats.routed_total(), 0);
    }
}
