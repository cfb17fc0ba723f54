//! Last known playback status of the connected receiver.
//!
//! The record has its own lock, independent of the device registry. The status
//! listener callback writes it; presentation refresh and duration/title backfill
//! read it. Writes from a listener belonging to a finished session are dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::protocol::{Message, StatusMessage};
use crate::remote::{MediaCondition, MediaState, PlayerStatus, StatusListener};

pub const POSITION_UNSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Position in milliseconds, `POSITION_UNSET` when cleared.
    pub position_ms: i64,
    pub state: MediaState,
    pub condition: MediaCondition,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            position_ms: POSITION_UNSET,
            state: MediaState::NoSource,
            condition: MediaCondition::Good,
        }
    }
}

impl Status {
    pub fn clear(&mut self) {
        self.position_ms = POSITION_UNSET;
        self.state = MediaState::NoSource;
    }
}

#[derive(Debug, Default)]
struct StatusRecord {
    active_epoch: Option<u64>,
    status: Status,
}

/// Lock-guarded status record shared between the listener and its readers.
#[derive(Debug, Default)]
pub struct StatusStore {
    record: Mutex<StatusRecord>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_record(&self) -> MutexGuard<'_, StatusRecord> {
        match self.record.lock() {
            Ok(record) => record,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts accepting writes tagged with `epoch` and clears the record.
    pub fn activate(&self, epoch: u64) {
        let mut record = self.lock_record();
        record.active_epoch = Some(epoch);
        record.status.clear();
    }

    pub fn deactivate(&self) {
        let mut record = self.lock_record();
        record.active_epoch = None;
        record.status.clear();
    }

    pub fn active_epoch(&self) -> Option<u64> {
        self.lock_record().active_epoch
    }

    pub fn clear(&self) {
        self.lock_record().status.clear();
    }

    pub fn snapshot(&self) -> Status {
        self.lock_record().status
    }

    pub fn state(&self) -> MediaState {
        self.lock_record().status.state
    }

    /// Applies a pushed status change. Returns the new record when `epoch` is active.
    pub fn apply_change(
        &self,
        epoch: u64,
        player_status: PlayerStatus,
        position_ms: i64,
    ) -> Option<Status> {
        let mut record = self.lock_record();
        if record.active_epoch != Some(epoch) {
            return None;
        }
        record.status.state = player_status.state;
        record.status.condition = player_status.condition;
        record.status.position_ms = position_ms;
        Some(record.status)
    }

    /// Stores a queried status, leaving the position untouched.
    pub fn apply_queried(&self, epoch: u64, player_status: PlayerStatus) -> Option<Status> {
        let mut record = self.lock_record();
        if record.active_epoch != Some(epoch) {
            return None;
        }
        record.status.state = player_status.state;
        record.status.condition = player_status.condition;
        Some(record.status)
    }

    pub fn apply_position(&self, epoch: u64, position_ms: i64) -> Option<Status> {
        let mut record = self.lock_record();
        if record.active_epoch != Some(epoch) {
            return None;
        }
        record.status.position_ms = position_ms;
        Some(record.status)
    }
}

/// Status listener that records pushes and forwards them onto the bus.
pub struct BusStatusListener {
    id: Uuid,
    epoch: u64,
    store: Arc<StatusStore>,
    bus_producer: Sender<Message>,
}

impl BusStatusListener {
    pub fn new(epoch: u64, store: Arc<StatusStore>, bus_producer: Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            store,
            bus_producer,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl StatusListener for BusStatusListener {
    fn listener_id(&self) -> Uuid {
        self.id
    }

    fn on_status_change(&self, status: PlayerStatus, position_ms: i64) {
        match self.store.apply_change(self.epoch, status, position_ms) {
            Some(status) => {
                debug!(
                    "BusStatusListener: state={:?} position={}",
                    status.state,
                    crate::presentation::format_playback_time(status.position_ms)
                );
                let _ = self
                    .bus_producer
                    .send(Message::Status(StatusMessage::StatusChanged {
                        epoch: self.epoch,
                        status,
                    }));
            }
            None => debug!(
                "BusStatusListener: dropping status for inactive session {}",
                self.epoch
            ),
        }
    }
}
