//! Subscription lifecycle for one transport
//!
//! The default (cloud-to-device) subscription is driven by the transport state
//! itself: `Open -> Subscribing -> Receiving`, with one winner issuing the
//! SUBSCRIBE and every other caller waiting on the same completion. Method,
//! twin-patch, twin-response and module-event subscriptions are independent
//! named entries toggled explicitly.

use super::completion::Completion;
use super::state::{AtomicTransportState, TransportState};
use crate::error::{TransportError, TransportResult};
use crate::transport::channel::{Channel, OutboundFrame, QualityOfService};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Explicitly enabled subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    TwinResponse,
    Methods,
    TwinPatch,
    ModuleEvents,
}

#[derive(Debug)]
pub struct SubscriptionStateMachine {
    /// Completion for the in-flight default subscribe, replaced per attempt
    default_attempt: Mutex<Option<Arc<Completion>>>,
    named: tokio::sync::Mutex<HashSet<SubscriptionKind>>,
    timeout: Duration,
}

enum DefaultRole {
    Leader(Arc<Completion>),
    Follower(Arc<Completion>),
    Done,
}

impl SubscriptionStateMachine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            default_attempt: Mutex::new(None),
            named: tokio::sync::Mutex::new(HashSet::new()),
            timeout,
        }
    }

    fn attempt(&self) -> MutexGuard<'_, Option<Arc<Completion>>> {
        self.default_attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a frame and wait for its broker acknowledgment, bounded by the
    /// subscribe timeout and the caller's cancellation.
    pub async fn write_acknowledged(
        &self,
        channel: &dyn Channel,
        frame: OutboundFrame,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        tokio::select! {
            result = tokio::time::timeout(self.timeout, channel.write_and_flush(frame)) => {
                result.map_err(|_| TransportError::timeout("waiting for subscription acknowledgment"))?
            }
            _ = cancel.cancelled() => Err(TransportError::Canceled),
        }
    }

    /// Make sure the default subscription is in place, subscribing if needed.
    ///
    /// Returns `NotConnected` when the transport is not open-compatible.
    pub async fn ensure_default(
        &self,
        state: &AtomicTransportState,
        channel: &dyn Channel,
        filter: &str,
        qos: QualityOfService,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let role = {
            let mut attempt = self.attempt();
            match state.load() {
                TransportState::Receiving => DefaultRole::Done,
                TransportState::Open => {
                    if state.try_transition(TransportState::Open, TransportState::Subscribing) {
                        let completion = Arc::new(Completion::new());
                        *attempt = Some(completion.clone());
                        DefaultRole::Leader(completion)
                    } else {
                        // Lost the transition to a closer or a fault
                        return Err(not_usable(state.load()));
                    }
                }
                TransportState::Subscribing => match attempt.as_ref() {
                    Some(completion) => DefaultRole::Follower(completion.clone()),
                    None => return Err(not_usable(state.load())),
                },
                other => return Err(not_usable(other)),
            }
        };

        match role {
            DefaultRole::Done => Ok(()),
            DefaultRole::Follower(completion) => completion.wait(cancel).await,
            DefaultRole::Leader(completion) => {
                info!(filter = %filter, "Subscribing to default topic");
                let frame = OutboundFrame::Subscribe {
                    filter: filter.to_string(),
                    qos,
                };
                match self.write_acknowledged(channel, frame, cancel).await {
                    Ok(()) => {
                        if state.try_transition(TransportState::Subscribing, TransportState::Receiving)
                        {
                            completion.try_complete();
                            debug!(filter = %filter, "Default subscription active");
                        }
                        // A concurrent close or fault already settled the completion
                        completion.wait(&CancellationToken::new()).await
                    }
                    Err(error) => {
                        completion.try_fail(error.clone());
                        // Let a later caller retry unless the transport moved on
                        state.try_transition(TransportState::Subscribing, TransportState::Open);
                        Err(error)
                    }
                }
            }
        }
    }

    /// Cancel the in-flight default subscribe; waiters see `AlreadyClosed`
    pub fn cancel_pending(&self) {
        if let Some(completion) = self.attempt().as_ref() {
            completion.try_cancel();
        }
    }

    /// Fail the in-flight default subscribe with the transport's fatal error
    pub fn fail_pending(&self, error: TransportError) {
        if let Some(completion) = self.attempt().as_ref() {
            completion.try_fail(error);
        }
    }

    /// Subscribe `filter` under `kind`; no-op when already enabled
    pub async fn enable(
        &self,
        kind: SubscriptionKind,
        channel: &dyn Channel,
        filter: &str,
        qos: QualityOfService,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let mut enabled = self.named.lock().await;
        if enabled.contains(&kind) {
            return Ok(());
        }

        let frame = OutboundFrame::Subscribe {
            filter: filter.to_string(),
            qos,
        };
        self.write_acknowledged(channel, frame, cancel).await?;
        enabled.insert(kind);
        info!(kind = ?kind, filter = %filter, "Subscription enabled");
        Ok(())
    }

    /// Unsubscribe `filter` under `kind`; no-op when not enabled
    pub async fn disable(
        &self,
        kind: SubscriptionKind,
        channel: &dyn Channel,
        filter: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let mut enabled = self.named.lock().await;
        if !enabled.contains(&kind) {
            return Ok(());
        }

        let frame = OutboundFrame::Unsubscribe {
            filter: filter.to_string(),
        };
        self.write_acknowledged(channel, frame, cancel).await?;
        enabled.remove(&kind);
        info!(kind = ?kind, filter = %filter, "Subscription disabled");
        Ok(())
    }

    pub async fn is_enabled(&self, kind: SubscriptionKind) -> bool {
        self.named.lock().await.contains(&kind)
    }
}

fn not_usable(state: TransportState) -> TransportError {
    match state {
        TransportState::Closed => TransportError::AlreadyClosed,
        other => TransportError::NotConnected { state: other },
    }
}
