//! Session-scoped signaling channel
//!
//! Wraps a [`SignalingService`] with the session key and local peer id so the
//! rest of the session never handles raw paths. Publishing failures surface as
//! terminal [`SessionError::Signaling`] errors; there is no retry.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::transport::{PresenceSet, SignalingService, Subscription};
use crate::types::{
    IceCandidate, PeerId, PresenceRecord, SessionDescription, SignalingMessage,
};

/// Signaling access for one peer in one session
#[derive(Clone)]
pub struct SignalingChannel {
    service: Arc<dyn SignalingService>,
    session_key: String,
    local_peer_id: PeerId,
    joined_at: Option<u64>,
}

impl SignalingChannel {
    pub fn new(
        service: Arc<dyn SignalingService>,
        session_key: impl Into<String>,
        local_peer_id: impl Into<PeerId>,
    ) -> Self {
        Self {
            service,
            session_key: session_key.into(),
            local_peer_id: local_peer_id.into(),
            joined_at: None,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Presence stamp carried by every message published after [`announce`](Self::announce)
    pub fn joined_at(&self) -> Option<u64> {
        self.joined_at
    }

    /// Append a message to the session log
    pub async fn publish(&self, msg: SignalingMessage) -> Result<(), SessionError> {
        let msg = match (msg.joined_at, self.joined_at) {
            (None, Some(joined_at)) => msg.stamped(joined_at),
            _ => msg,
        };
        debug!(
            "[Signaling] {} publishing {} to {}",
            self.local_peer_id, msg.kind, self.session_key
        );
        self.service
            .publish(&self.session_key, msg)
            .await
            .map_err(|e| {
                warn!("[Signaling] publish to {} failed: {}", self.session_key, e);
                SessionError::Signaling(e.to_string())
            })
    }

    pub async fn publish_offer(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.publish(SignalingMessage::offer(&self.local_peer_id, desc))
            .await
    }

    pub async fn publish_answer(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.publish(SignalingMessage::answer(&self.local_peer_id, desc))
            .await
    }

    pub async fn publish_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.publish(SignalingMessage::candidate(&self.local_peer_id, candidate))
            .await
    }

    pub async fn publish_ready(&self) -> Result<(), SessionError> {
        self.publish(SignalingMessage::ready(&self.local_peer_id))
            .await
    }

    pub async fn publish_disconnect(&self) -> Result<(), SessionError> {
        self.publish(SignalingMessage::disconnect(&self.local_peer_id))
            .await
    }

    /// Every past and future message of the session, own messages included
    pub async fn subscribe(&self) -> Result<Subscription<SignalingMessage>, SessionError> {
        self.service
            .subscribe(&self.session_key)
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }

    /// Write the local presence record
    pub async fn announce(&mut self) -> Result<PresenceRecord, SessionError> {
        let record = PresenceRecord::now();
        self.service
            .set_presence(&self.session_key, &self.local_peer_id, record)
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        self.joined_at = Some(record.joined_at);
        Ok(record)
    }

    /// Remove the local presence record
    pub async fn withdraw(&self) -> Result<(), SessionError> {
        self.service
            .remove_presence(&self.session_key, &self.local_peer_id)
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }

    /// Live presence set of the session
    pub async fn subscribe_presence(&self) -> Result<Subscription<PresenceSet>, SessionError> {
        self.service
            .subscribe_presence(&self.session_key)
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemorySignaling;
    use crate::types::SignalingKind;

    #[tokio::test]
    async fn test_publish_tags_sender() {
        let service = MemorySignaling::new();
        let channel = SignalingChannel::new(service.clone(), "abc123", "peer-a");

        channel
            .publish_offer(&SessionDescription::offer("v=0"))
            .await
            .unwrap();
        channel.publish_ready().await.unwrap();

        let log = service.messages("abc123").await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sender_id, "peer-a");
        assert_eq!(log[0].kind, SignalingKind::Offer);
        assert_eq!(log[0].description().unwrap().sdp, "v=0");
        assert_eq!(log[1].kind, SignalingKind::Ready);
    }

    #[tokio::test]
    async fn test_subscriber_sees_own_messages() {
        let service = MemorySignaling::new();
        let channel = SignalingChannel::new(service, "abc123", "peer-a");
        let mut sub = channel.subscribe().await.unwrap();

        channel.publish_ready().await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert!(msg.is_from("peer-a"));
    }

    #[tokio::test]
    async fn test_publish_failure_is_signaling_error() {
        let service = MemorySignaling::new();
        service.set_online(false);
        let channel = SignalingChannel::new(service, "abc123", "peer-a");

        let err = channel.publish_ready().await.unwrap_err();
        assert!(matches!(err, SessionError::Signaling(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_announce_and_withdraw() {
        let service = MemorySignaling::new();
        let mut channel = SignalingChannel::new(service.clone(), "abc123", "peer-a");

        let record = channel.announce().await.unwrap();
        assert_eq!(service.presence("abc123").await.get("peer-a"), Some(&record));

        channel.withdraw().await.unwrap();
        assert!(service.presence("abc123").await.is_empty());
    }

    #[tokio::test]
    async fn test_messages_carry_presence_stamp() {
        let service = MemorySignaling::new();
        let mut channel = SignalingChannel::new(service.clone(), "abc123", "peer-a");
        channel.publish_ready().await.unwrap();

        let first = channel.announce().await.unwrap();
        channel.publish_ready().await.unwrap();
        let second = channel.announce().await.unwrap();
        assert!(second.joined_at > first.joined_at);
        channel.publish_disconnect().await.unwrap();

        let stamps: Vec<_> = service
            .messages("abc123")
            .await
            .iter()
            .map(|m| m.joined_at)
            .collect();
        assert_eq!(
            stamps,
            vec![None, Some(first.joined_at), Some(second.joined_at)]
        );
    }

    #[tokio::test]
    async fn test_subscription_replays_history_as_stream() {
        use futures::StreamExt;

        let service = MemorySignaling::new();
        let a = SignalingChannel::new(service.clone(), "abc123", "peer-a");
        let b = SignalingChannel::new(service, "abc123", "peer-b");
        a.publish_ready().await.unwrap();
        b.publish_ready().await.unwrap();

        let senders: Vec<String> = b
            .subscribe()
            .await
            .unwrap()
            .take(2)
            .map(|m| m.sender_id)
            .collect()
            .await;
        assert_eq!(senders, vec!["peer-a", "peer-b"]);

        let mut presence = b.subscribe_presence().await.unwrap();
        assert!(presence.next().await.unwrap().is_empty());
    }
}
