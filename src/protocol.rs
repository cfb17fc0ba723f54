//! Event-bus protocol shared by all runtime components.
//!
//! Discovery callbacks, user intents, background remote-call results and
//! presentation notifications all travel as `Message` values on one broadcast bus.

use crate::catalog::MediaItem;
use crate::device_registry::{Device, DeviceSummary};
use crate::error::FlingError;
use crate::remote::PlayerStatus;
use crate::session::SessionState;
use crate::status::Status;
use crate::transport::{QueryValue, TransportCommand, TransportQuery};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Discovery(DiscoveryMessage),
    Session(SessionMessage),
    Transport(TransportMessage),
    Status(StatusMessage),
    Notification(NotificationMessage),
}

/// Discovery callbacks and registry change notifications.
#[derive(Debug, Clone)]
pub enum DiscoveryMessage {
    DeviceFound(Device),
    DeviceLost(Device),
    DiscoveryFailure(String),
    /// Registry changed; carries the name-sorted view.
    DevicesUpdated(Vec<DeviceSummary>),
}

/// Session intents, lifecycle signals and connect/disconnect results.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Connect {
        device_id: String,
    },
    Disconnect,
    /// Host is leaving the foreground: persist, detach with a bounded wait, clean.
    AppPausing,
    /// Acknowledges `AppPausing` once cleanup finished.
    Paused,
    /// Host returned: re-read the last player id and reset the error window.
    Resume,
    Shutdown,
    ConnectFinished {
        ticket: u64,
        result: Result<(), FlingError>,
    },
    /// Status query plus listener attach for a rejoin candidate.
    RejoinFinished {
        ticket: u64,
        result: Result<PlayerStatus, FlingError>,
    },
    DisconnectFinished {
        ticket: u64,
        result: Result<(), FlingError>,
    },
    StatusQueried {
        epoch: u64,
        result: Result<PlayerStatus, FlingError>,
    },
    StateChanged {
        state: SessionState,
        device: Option<DeviceSummary>,
    },
}

/// Transport intents and their background results.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Fling(MediaItem),
    /// Play when paused or ready, otherwise fling the selected catalog entry.
    PlayOrFling {
        selected: Option<MediaItem>,
    },
    Play,
    Pause,
    Stop,
    Forward,
    Backward,
    /// Absolute seek requested from the progress control, in milliseconds.
    SeekTo(i64),
    CommandFinished {
        epoch: u64,
        command: TransportCommand,
        result: Result<(), FlingError>,
    },
    QueryFinished {
        epoch: u64,
        /// Media generation the query was issued under.
        generation: u64,
        query: TransportQuery,
        result: Result<QueryValue, FlingError>,
    },
}

/// Changes to the status record and the cached duration and title.
#[derive(Debug, Clone)]
pub enum StatusMessage {
    /// Pushed by the status listener of session `epoch`.
    StatusChanged { epoch: u64, status: Status },
    /// Record rewritten by the session manager (stop, status query, position query).
    StatusSnapshot(Status),
    DurationUpdated(i64),
    DurationReset,
    TitleUpdated(String),
    TitleReset,
    /// Status, duration and title all cleared.
    SessionReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationMessage {
    Toast(String),
    ErrorDialog { title: String, message: String },
}
