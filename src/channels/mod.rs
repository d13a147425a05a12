//! Channel surface: how external adapters hand requests to the runtime.
//!
//! Concrete chat adapters (Slack, Telegram, …) live outside this crate;
//! they only need `IncomingRequest` and the orchestrator's reply string.
//! The dashboard HTTP channel ships here because the runtime serves it.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for channel startup and delivery.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

/// A request handed to the orchestrator by any channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRequest {
    pub source: String,
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl IncomingRequest {
    pub fn new(source: &str, channel_id: &str, user_id: &str) -> Self {
        Self {
            source: source.to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Health record per channel, surfaced in runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
            updated_at: Utc::now(),
        }
    }
}

/// Trait implemented by chat channel adapters. The runtime starts and
/// stops them; each adapter pushes requests in and delivers replies out.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening. Implementations spawn their own tasks and resolve
    /// once the channel is accepting traffic.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Deliver a reply produced for a request this channel submitted.
    async fn deliver(&self, request: &IncomingRequest, reply: &str) -> Result<(), ChannelError>;

    /// Stop listening and release resources.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_request_builder() {
        let request = IncomingRequest::new("slack", "C042", "U9").with_session("thread-1");
        assert_eq!(request.source, "slack");
        assert_eq!(request.session_id.as_deref(), Some("thread-1"));
    }

    #[test]
    fn test_channel_health_states() {
        assert!(ChannelHealth::healthy().healthy);
        let down = ChannelHealth::unhealthy("socket closed");
        assert!(!down.healthy);
        assert_eq!(down.detail.as_deref(), Some("socket closed"));
    }
}
