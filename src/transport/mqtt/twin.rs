//! Request/response correlation for twin GET and PATCH
//!
//! Each round trip registers a one-shot waiter under a fresh request id. An
//! inbound response resolves exactly the waiter whose id it carries; the waiter
//! is unregistered on every exit path.

use super::topics::parse_twin_response;
use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type Waiter = oneshot::Sender<TransportResult<Bytes>>;

#[derive(Debug)]
pub struct TwinRequestCorrelator {
    pending: Mutex<HashMap<String, Waiter>>,
    timeout: Duration,
}

/// Removes the registry entry when the round trip ends, however it ends
struct Registration<'a> {
    correlator: &'a TwinRequestCorrelator,
    request_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.correlator.waiters().remove(&self.request_id);
    }
}

impl TwinRequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        // Entries stay consistent even if a holder panicked
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.waiters().len()
    }

    /// Issue a request through `send` and wait for its response body.
    ///
    /// `send` receives the generated request id and must write the request frame
    /// (whose topic embeds the id).
    pub async fn round_trip<F, Fut>(
        &self,
        send: F,
        cancel: &CancellationToken,
    ) -> TransportResult<Bytes>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = TransportResult<()>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(request_id.clone(), tx);
        let _registration = Registration {
            correlator: self,
            request_id: request_id.clone(),
        };

        debug!(request_id = %request_id, "Sending twin request");
        send(request_id.clone()).await?;

        tokio::select! {
            response = tokio::time::timeout(self.timeout, rx) => match response {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::AlreadyClosed),
                Err(_) => {
                    warn!(request_id = %request_id, "Twin request timed out");
                    Err(TransportError::timeout(format!(
                        "twin response for request {request_id}"
                    )))
                }
            },
            _ = cancel.cancelled() => Err(TransportError::Canceled),
        }
    }

    /// Hand an inbound twin response to its waiter. Returns false when no
    /// waiter matches (late, duplicate or foreign response).
    pub fn dispatch_response(&self, topic: &str, payload: Bytes) -> bool {
        let Some(response) = parse_twin_response(topic) else {
            warn!(topic = %topic, "Malformed twin response topic");
            return false;
        };

        let Some(waiter) = self.waiters().remove(&response.request_id) else {
            debug!(request_id = %response.request_id, "No pending twin request for response");
            return false;
        };

        let result = if response.status >= 300 {
            Err(TransportError::ServiceRejected {
                status: response.status,
            })
        } else {
            Ok(payload)
        };
        // Receiver gone means the caller already gave up
        let _ = waiter.send(result);
        true
    }

    /// Fail every outstanding request, used on transport teardown
    pub fn fail_all(&self, error: TransportError) {
        let drained: Vec<Waiter> = self.waiters().drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
