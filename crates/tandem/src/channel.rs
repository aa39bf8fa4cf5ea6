//! Data channel transport
//!
//! Holds the negotiated data channel and frames application messages onto
//! it. The channel is attached once the impolite side creates it or the
//! polite side receives it; until then every send fails with
//! [`SessionError::ChannelSend`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::{encode_envelope, Envelope};
use crate::transport::DataChannel;

/// Frame and byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
pub struct DataChannelTransport {
    channel: Option<Arc<dyn DataChannel>>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl DataChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the negotiated channel, replacing any previous one
    pub fn attach(&mut self, channel: Arc<dyn DataChannel>) {
        debug!("[Channel] attached data channel '{}'", channel.label());
        self.channel = Some(channel);
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn label(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.label())
    }

    /// Check if frames can be sent right now
    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    /// Serialize and send one message
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let channel = match &self.channel {
            Some(c) if c.is_open() => c,
            _ => {
                warn!(
                    "[Channel] dropping {} frame: data channel not open",
                    envelope.type_name()
                );
                return Err(SessionError::ChannelSend("data channel not open".into()));
            }
        };

        let text = encode_envelope(envelope)
            .map_err(|e| SessionError::ChannelSend(format!("encode failed: {}", e)))?;
        let len = text.len() as u64;

        channel.send_text(text).await.map_err(|e| {
            warn!("[Channel] {} send failed: {}", envelope.type_name(), e);
            SessionError::ChannelSend(e.to_string())
        })?;

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Account for an incoming frame
    pub fn record_received(&self, text: &str) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(text.len() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Close and detach the channel
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
            debug!("[Channel] closed data channel '{}'", channel.label());
        }
    }
}
