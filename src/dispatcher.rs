//! Notification dispatcher
//!
//! Turns state transitions into deduplicated outbound notifications. The
//! outbound queue decouples delivery from the ledger pipeline: a slow or
//! failing transport never blocks ingestion. Delivery failures are retried
//! with capped, jittered backoff; exhausted deliveries are recorded as
//! permanently failed and surfaced for operator inspection.

use crate::records::{NotificationRecord, NotificationStatus};
use crate::store::LedgerStore;
use alloy_primitives::{keccak256, Address, B256};
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What kind of state change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An ether payment touched the address
    Payment,
    /// A token transfer touched the address
    TokenPayment,
    /// A registered contract event filter matched
    FilterMatch,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Payment => "payment",
            EventKind::TokenPayment => "token_payment",
            EventKind::FilterMatch => "filter_match",
        }
    }
}

/// One outbound notification bound for a single registration tuple.
#[derive(Debug, Clone)]
pub struct OutboundNotification {
    pub client_id: String,
    pub service: String,
    pub registration_id: String,
    pub eth_address: Address,
    pub kind: EventKind,
    pub payload: String,
    /// Idempotency key: identifies this (event, registration tuple) pair
    pub digest: B256,
}

/// Transport seam. Real push backends live outside this crate; the
/// dispatcher only needs a way to hand one notification to one endpoint.
pub trait NotificationTransport: Send + Sync + 'static {
    fn deliver(&self, notification: &OutboundNotification) -> Result<()>;
}

/// Retry policy for the delivery worker.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Notification dispatcher over the ledger store.
pub struct NotificationDispatcher<S: LedgerStore> {
    store: Arc<S>,
    queue: mpsc::Sender<OutboundNotification>,
}

impl<S: LedgerStore> NotificationDispatcher<S> {
    /// Create the dispatcher and the receiving end of its outbound queue.
    /// Hand the receiver to `run_delivery_worker`.
    pub fn new(store: Arc<S>, queue_capacity: usize) -> (Self, mpsc::Receiver<OutboundNotification>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        (Self { store, queue: tx }, rx)
    }

    /// Idempotency key over the event identity and the registration tuple.
    fn digest(
        subject: Address,
        kind: EventKind,
        payload: &str,
        client_id: &str,
        service: &str,
        registration_id: &str,
    ) -> B256 {
        let mut buf = Vec::new();
        buf.extend_from_slice(subject.as_slice());
        buf.push(0x00);
        buf.extend_from_slice(kind.as_str().as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(payload.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(client_id.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(service.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(registration_id.as_bytes());
        keccak256(&buf)
    }

    /// Emit one notification per registration tuple for the address.
    ///
    /// Redelivery of the same upstream event is a no-op per tuple: an
    /// existing delivery record suppresses the emission. Returns the number
    /// of notifications enqueued.
    pub fn notify(&self, subject: Address, kind: EventKind, payload: &str) -> Result<usize> {
        let registrations = self.store.get_registrations_for_address(subject)?;
        if registrations.is_empty() {
            return Ok(0);
        }

        let mut enqueued = 0;
        for reg in registrations {
            let digest = Self::digest(
                subject,
                kind,
                payload,
                &reg.client_id,
                &reg.service,
                &reg.registration_id,
            );

            if self.store.get_notification(digest)?.is_some() {
                debug!(
                    "Suppressing duplicate {} notification for {:?} ({})",
                    kind.as_str(),
                    subject,
                    reg.registration_id
                );
                continue;
            }

            self.store.put_notification(
                digest,
                &NotificationRecord {
                    status: NotificationStatus::Pending,
                    attempts: 0,
                    created: unix_now(),
                },
            )?;

            let outbound = OutboundNotification {
                client_id: reg.client_id,
                service: reg.service,
                registration_id: reg.registration_id,
                eth_address: reg.eth_address,
                kind,
                payload: payload.to_string(),
                digest,
            };

            if self.enqueue(outbound) {
                enqueued += 1;
            }
        }

        Ok(enqueued)
    }

    /// Emit a contract-event notification to one filter registration.
    ///
    /// Filter registrations address endpoints by registration id rather
    /// than wallet address, so the registration tuple is synthesized from
    /// the filter; dedup works the same way as address notifications.
    pub fn notify_filter_match(
        &self,
        registration_id: &str,
        contract: Address,
        payload: &str,
    ) -> Result<bool> {
        let digest = Self::digest(
            contract,
            EventKind::FilterMatch,
            payload,
            registration_id,
            "filter",
            registration_id,
        );

        if self.store.get_notification(digest)?.is_some() {
            debug!(
                "Suppressing duplicate filter notification for {} on {:?}",
                registration_id, contract
            );
            return Ok(false);
        }

        self.store.put_notification(
            digest,
            &NotificationRecord {
                status: NotificationStatus::Pending,
                attempts: 0,
                created: unix_now(),
            },
        )?;

        Ok(self.enqueue(OutboundNotification {
            client_id: registration_id.to_string(),
            service: "filter".to_string(),
            registration_id: registration_id.to_string(),
            eth_address: contract,
            kind: EventKind::FilterMatch,
            payload: payload.to_string(),
            digest,
        }))
    }

    /// Hand one notification to the outbound queue. Backpressure is
    /// absorbed here, never propagated upstream: a full queue drops the
    /// delivery attempt and leaves the record pending for the operator to
    /// see.
    fn enqueue(&self, outbound: OutboundNotification) -> bool {
        match self.queue.try_send(outbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(
                    "Outbound notification queue full; dropping delivery for {:?} ({})",
                    n.eth_address, n.registration_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Outbound notification queue closed");
                false
            }
        }
    }
}

/// Drain the outbound queue, delivering each notification with bounded,
/// jittered exponential backoff. Runs until the dispatcher side closes.
pub async fn run_delivery_worker<S, T>(
    store: Arc<S>,
    mut queue: mpsc::Receiver<OutboundNotification>,
    transport: T,
    policy: RetryPolicy,
) where
    S: LedgerStore,
    T: NotificationTransport,
{
    info!("Notification delivery worker started");

    while let Some(notification) = queue.recv().await {
        let mut attempts = 0u32;
        let mut delivered = false;

        while attempts < policy.max_attempts {
            attempts += 1;
            match transport.deliver(&notification) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Delivery attempt {}/{} failed for {:?} ({}): {}",
                        attempts,
                        policy.max_attempts,
                        notification.eth_address,
                        notification.registration_id,
                        e
                    );
                    if attempts < policy.max_attempts {
                        let backoff = policy
                            .base_delay_ms
                            .saturating_mul(1u64 << (attempts - 1).min(16))
                            .min(policy.max_delay_ms);
                        let jitter = rand::thread_rng().gen_range(0..=backoff / 2 + 1);
                        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                    }
                }
            }
        }

        let status = if delivered {
            NotificationStatus::Delivered
        } else {
            error!(
                "Delivery permanently failed for {:?} ({}) after {} attempts",
                notification.eth_address, notification.registration_id, attempts
            );
            NotificationStatus::Failed
        };

        let record = NotificationRecord {
            status,
            attempts,
            created: store
                .get_notification(notification.digest)
                .ok()
                .flatten()
                .map(|r| r.created)
                .unwrap_or_else(unix_now),
        };
        if let Err(e) = store.put_notification(notification.digest, &record) {
            error!("Failed to persist notification record: {:#}", e);
        }
    }

    info!("Notification delivery worker stopped");
}
