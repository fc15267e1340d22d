//! Device State Machine
//!
//! Turns the overlapping event snapshots delivered by every poll into a
//! deduplicated event log, a coarse [`DeviceState`] with a readiness flag,
//! and outbound [`DeviceNotification`]s.
//!
//! Waiting operations do not spin: readiness, the "new event" flag and the
//! log revision are published through `watch` channels and every wait also
//! observes a [`CancellationToken`].

use super::bill_types::BillTypeTable;
use super::events::{DeviceEvent, DeviceState, EventLog};
use super::DeviceError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Cached device property that changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    /// Equipment category id
    EquipmentCategory,
    /// Product code
    ProductCode,
    /// Build code
    BuildCode,
    /// Manufacturer id
    ManufacturerId,
    /// Serial number
    SerialNumber,
    /// Software revision block
    SoftwareRevision,
    /// ccTalk comms revision
    CommsRevision,
    /// Option flags
    OptionFlags,
    /// ROM checksums
    Checksums,
    /// Country scaling factor
    ScalingFactor,
    /// Currency revision
    CurrencyRevision,
    /// Operation mode
    OperationMode,
    /// Bill type table (ids, inhibit bits, fill sizes)
    BillTypes,
}

/// Outbound notification of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceNotification {
    /// Coarse state recomputed after an inserted event
    StateChanged {
        /// New state
        state: DeviceState,
    },
    /// Batch of new events, oldest first
    PollResponse {
        /// The new events
        events: Vec<DeviceEvent>,
    },
    /// A bill was taken in outside of a dispense
    BillAccepted {
        /// Bill type id
        bill_type: u8,
        /// Configured value code of that bill type
        nominal: u32,
    },
    /// A cached property was refreshed
    PropertyUpdated {
        /// Which property
        property: Property,
    },
}

#[derive(Debug)]
struct Inner {
    log: EventLog,
    state: DeviceState,
    pay_mode_seen: bool,
    busy_seen: bool,
}

impl Inner {
    fn clear_flags(&mut self) {
        self.pay_mode_seen = false;
        self.busy_seen = false;
    }

    /// Sticky flag bookkeeping; returns the bill accepted by `event`, if any
    fn track(&mut self, state: DeviceState, event: &DeviceEvent) -> Option<u8> {
        if state.is_ready() || state == DeviceState::Init {
            self.clear_flags();
        }
        match state {
            DeviceState::PayMode => self.pay_mode_seen = true,
            DeviceState::Busy => self.busy_seen = true,
            DeviceState::BillAccepted if !self.pay_mode_seen && self.busy_seen => {
                return Some(event.bill_type());
            }
            DeviceState::BillAccepted => self.clear_flags(),
            _ => {}
        }
        None
    }
}

/// Event log, derived state and waiting primitives of one device
#[derive(Debug)]
pub struct DeviceStateMachine {
    inner: Mutex<Inner>,
    bill_types: Arc<RwLock<BillTypeTable>>,
    ready: watch::Sender<bool>,
    new_event: watch::Sender<bool>,
    revision: watch::Sender<u64>,
    notifications: broadcast::Sender<DeviceNotification>,
}

impl DeviceStateMachine {
    /// Create a state machine resolving nominals through `bill_types`
    pub fn new(bill_types: Arc<RwLock<BillTypeTable>>) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                log: EventLog::new(),
                state: DeviceState::NoEvents,
                pay_mode_seen: false,
                busy_seen: false,
            }),
            bill_types,
            ready: watch::Sender::new(false),
            new_event: watch::Sender::new(false),
            revision: watch::Sender::new(0),
            notifications,
        }
    }

    /// Subscribe to device notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifications.subscribe()
    }

    /// Publish a notification to every subscriber
    pub fn notify(&self, notification: DeviceNotification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }

    /// Current coarse state
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Whether the device accepts commands
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Whether the last poll brought new events
    pub fn has_new_event(&self) -> bool {
        *self.new_event.borrow()
    }

    /// Copy of the event log, oldest first
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.inner.lock().log.iter().copied().collect()
    }

    /// Merge one poll's snapshot (hardware order, newest first)
    ///
    /// Returns the number of events appended to the log. Notifications are
    /// sent after the log lock is released.
    pub fn process_snapshot(&self, snapshot: &[DeviceEvent]) -> usize {
        let mut chronological: Vec<DeviceEvent> = snapshot.iter().rev().copied().collect();
        let mut outbox = Vec::new();

        let fresh = {
            let mut inner = self.inner.lock();
            if chronological.first().map(DeviceEvent::kind) == Some(DeviceState::NoEvents) {
                inner.log.clear();
                self.new_event.send_replace(false);
                return 0;
            }

            let count = inner.log.count_new(&chronological);
            self.new_event.send_replace(count > 0);
            if count == 0 {
                return 0;
            }

            let fresh = chronological.split_off(chronological.len() - count);
            for event in &fresh {
                inner.log.push(*event);
                let state = event.kind();
                inner.state = state;
                self.ready.send_replace(state.is_ready());
                outbox.push(DeviceNotification::StateChanged { state });

                if let Some(bill_type) = inner.track(state, event) {
                    let nominal = self.bill_types.read().nominal(bill_type);
                    tracing::info!("bill accepted: type {} nominal {}", bill_type, nominal);
                    outbox.push(DeviceNotification::BillAccepted { bill_type, nominal });
                }
            }
            self.revision.send_modify(|revision| *revision += 1);
            fresh
        };

        tracing::debug!(
            "{} new event(s): {}",
            fresh.len(),
            fresh.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        let count = fresh.len();
        outbox.push(DeviceNotification::PollResponse { events: fresh });
        for notification in outbox {
            self.notify(notification);
        }
        count
    }

    /// Wait until the device is ready
    ///
    /// A ready device wins over a pending cancellation.
    pub async fn wait_for_ready(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        let mut rx = self.ready.subscribe();
        tokio::select! {
            biased;
            reached = async { rx.wait_for(|ready| *ready).await.is_ok() } => {
                if reached { Ok(()) } else { Err(DeviceError::Cancelled) }
            }
            _ = token.cancelled() => Err(DeviceError::Cancelled),
        }
    }

    /// Wait until a poll brings no new events
    pub async fn wait_for_quiescence(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        let mut rx = self.new_event.subscribe();
        tokio::select! {
            biased;
            reached = async { rx.wait_for(|new_event| !*new_event).await.is_ok() } => {
                if reached { Ok(()) } else { Err(DeviceError::Cancelled) }
            }
            _ = token.cancelled() => Err(DeviceError::Cancelled),
        }
    }

    /// Wait for an unconsumed event of kind `target`
    ///
    /// Each scan walks the log newest to oldest and consumes every entry it
    /// visits, so an event satisfies at most one wait.
    pub async fn wait_for_event(
        &self,
        target: DeviceState,
        token: &CancellationToken,
    ) -> Result<(), DeviceError> {
        tracing::debug!("waiting for {}", target);
        let mut rx = self.revision.subscribe();
        loop {
            rx.mark_unchanged();
            if self.inner.lock().log.consume_until(target) {
                tracing::debug!("{} occurred", target);
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(DeviceError::Cancelled);
                    }
                }
                _ = token.cancelled() => {
                    tracing::debug!("waiting for {} cancelled", target);
                    return Err(DeviceError::Cancelled);
                }
            }
        }
    }
}
