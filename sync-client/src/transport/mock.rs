//! Mock transport for testing.
//!
//! Responses come from a queue first, then from a scripted handler, and
//! default to `Ack`. Inbound events are pushed with [`MockTransport::push_event`].
//! Responses can be held back to simulate a slow backend, either all of them
//! or only those answering matching requests.

use super::{Session, Transport, TransportError};
use crate::config::Credentials;
use async_trait::async_trait;
use chatsync_types::{RawEvent, Request, Response, UserInfo};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;
type RequestFilter = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the client owns
/// another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    events_tx: mpsc::UnboundedSender<RawEvent>,
    events_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawEvent>>>,
    gate: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    session_user: Option<UserInfo>,
    reachability_enabled: bool,
    sent_requests: Vec<Request>,
    response_queue: VecDeque<Response>,
    handler: Option<Handler>,
    /// Which responses a hold applies to; `None` holds everything.
    hold_filter: Option<RequestFilter>,
    fail_next_connect: Option<String>,
    deny_next_connect: Option<String>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
            events_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(events_rx)),
            gate: Arc::new(gate),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer requests with `handler` once the response queue is empty.
    pub fn respond_with<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.lock().handler = Some(Arc::new(handler));
    }

    /// Queue a response for the next `send()` call.
    pub fn queue_response(&self, response: Response) {
        self.lock().response_queue.push_back(response);
    }

    /// Deliver an inbound event to the next `next_event()` call.
    pub fn push_event(&self, event: RawEvent) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.events_tx.send(event);
    }

    /// Get all requests that were sent.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.lock().sent_requests.clone()
    }

    /// Count sent requests matching a predicate.
    pub fn count_sent(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.lock().sent_requests.iter().filter(|r| predicate(r)).count()
    }

    /// Set the user reported by the next session.
    pub fn set_session_user(&self, user: UserInfo) {
        self.lock().session_user = Some(user);
    }

    /// Report reachability as enabled in the next session.
    pub fn set_reachability_enabled(&self, enabled: bool) {
        self.lock().reachability_enabled = enabled;
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next connect() to be refused as unauthorized.
    pub fn deny_next_connect(&self, reason: &str) {
        self.lock().deny_next_connect = Some(reason.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Hold every response until [`MockTransport::release_responses`].
    pub fn hold_responses(&self) {
        self.lock().hold_filter = None;
        self.gate.send_replace(true);
    }

    /// Hold responses to requests matching `filter` until
    /// [`MockTransport::release_responses`]; other requests answer at once.
    ///
    /// The response is computed when the request is sent, so a held
    /// response reflects the handler's state at that moment.
    pub fn hold_responses_matching<F>(&self, filter: F)
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.lock().hold_filter = Some(Arc::new(filter));
        self.gate.send_replace(true);
    }

    /// Let held responses through.
    pub fn release_responses(&self) {
        self.gate.send_replace(false);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("sent_requests", &inner.sent_requests.len())
            .field("queued_responses", &inner.response_queue.len())
            .field("held", &*self.gate.borrow())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Session, TransportError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(reason) = inner.deny_next_connect.take() {
            return Err(TransportError::Denied(reason));
        }
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        let user = inner
            .session_user
            .clone()
            .unwrap_or_else(|| UserInfo::new(credentials.identity.clone()));
        Ok(Session {
            user,
            reachability_enabled: inner.reachability_enabled,
        })
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let (response, holdable) = {
            let mut inner = self.lock();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }

            let response = match inner.response_queue.pop_front() {
                Some(response) => response,
                None => match &inner.handler {
                    Some(handler) => handler(&request),
                    None => Response::Ack,
                },
            };
            let holdable = inner
                .hold_filter
                .as_ref()
                .map_or(true, |filter| filter(&request));
            inner.sent_requests.push(request);
            (response, holdable)
        };

        if holdable {
            let mut gate = self.gate.subscribe();
            while *gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(response)
    }

    async fn next_event(&self) -> Result<RawEvent, TransportError> {
        let mut events = self.events_rx.lock().await;
        events.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        Ok(())
    }
}
