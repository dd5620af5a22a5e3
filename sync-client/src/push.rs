//! Push notification collaborator.
//!
//! Delivery of push notifications is outside the client. The client only
//! registers device tokens and decodes payloads it is handed into a
//! [`ToastRef`].

use async_trait::async_trait;
use chatsync_types::{ChatError, ToastRef};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Push errors.
#[derive(Debug, Error)]
pub enum PushError {
    /// Token registration was refused.
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The payload does not describe a chat message.
    #[error("invalid push payload: {0}")]
    InvalidPayload(String),
}

impl From<PushError> for ChatError {
    fn from(err: PushError) -> Self {
        ChatError::Generic(err.to_string())
    }
}

/// Registers device tokens and decodes push payloads.
#[async_trait]
pub trait PushRegistrar: Send + Sync {
    /// Register a device token for push delivery.
    async fn register_token(&self, token: &[u8]) -> Result<(), PushError>;

    /// Stop push delivery to a device token.
    async fn deregister_token(&self, token: &[u8]) -> Result<(), PushError>;

    /// Decode a push payload into the channel and message it refers to.
    ///
    /// The default reads `{"channel_sid": ..., "message_index": ...}`.
    fn decode_payload(&self, payload: &serde_json::Value) -> Result<ToastRef, PushError> {
        decode_toast(payload)
    }
}

/// Read `{"channel_sid": ..., "message_index": ...}` from a push payload.
pub fn decode_toast(payload: &serde_json::Value) -> Result<ToastRef, PushError> {
    serde_json::from_value(payload.clone()).map_err(|e| PushError::InvalidPayload(e.to_string()))
}

/// Push registrar for testing. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockPush {
    inner: Arc<Mutex<MockPushInner>>,
}

#[derive(Debug, Default)]
struct MockPushInner {
    registered: Vec<Vec<u8>>,
    fail_next_register: Option<String>,
}

impl MockPush {
    /// Create a new mock registrar.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockPushInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tokens currently registered.
    pub fn registered(&self) -> Vec<Vec<u8>> {
        self.lock().registered.clone()
    }

    /// Cause the next register_token() to fail.
    pub fn fail_next_register(&self, error: &str) {
        self.lock().fail_next_register = Some(error.to_string());
    }
}

#[async_trait]
impl PushRegistrar for MockPush {
    async fn register_token(&self, token: &[u8]) -> Result<(), PushError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_register.take() {
            return Err(PushError::RegistrationFailed(error));
        }
        if !inner.registered.iter().any(|t| t == token) {
            inner.registered.push(token.to_vec());
        }
        Ok(())
    }

    async fn deregister_token(&self, token: &[u8]) -> Result<(), PushError> {
        self.lock().registered.retain(|t| t != token);
        Ok(())
    }
}
