//! View model for a host UI.
//!
//! The host owns one `PresentationModel`, drains bus messages into it on its own
//! thread and renders from the accessors. Nothing here touches a remote player.

use std::collections::VecDeque;

use log::debug;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

use crate::device_registry::DeviceSummary;
use crate::protocol::{
    DiscoveryMessage, Message, NotificationMessage, SessionMessage, StatusMessage,
};
use crate::remote::MediaState;
use crate::session::SessionState;
use crate::status::Status;

/// Pending toasts beyond this drop the oldest one.
pub const MAX_PENDING_TOASTS: usize = 32;

/// Formats milliseconds as `HH:MM:SS`. Negative values render as zero.
pub fn format_playback_time(time_ms: i64) -> String {
    let total_secs = time_ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

pub fn status_text(state: MediaState) -> Option<&'static str> {
    match state {
        MediaState::NoSource => None,
        MediaState::PreparingMedia => Some("Preparing media..."),
        MediaState::ReadyToPlay => Some("Ready to play"),
        MediaState::Playing => Some("Playing"),
        MediaState::Paused => Some("Paused"),
        MediaState::Finished => Some("Done"),
        MediaState::Seeking => Some("Seeking..."),
        MediaState::Error => Some("Error"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressView {
    pub position_ms: i64,
    pub max_ms: i64,
    pub position_label: String,
    pub duration_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDialog {
    pub title: String,
    pub message: String,
}

#[derive(Debug)]
pub struct PresentationModel {
    devices: Vec<DeviceSummary>,
    session_state: SessionState,
    connected: Option<DeviceSummary>,
    status: Status,
    status_text: Option<&'static str>,
    duration_ms: i64,
    duration_set: bool,
    title: Option<String>,
    status_visible: bool,
    progress_visible: bool,
    toasts: VecDeque<String>,
    dialog: Option<ErrorDialog>,
}

impl Default for PresentationModel {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            session_state: SessionState::Disconnected,
            connected: None,
            status: Status::default(),
            status_text: None,
            duration_ms: 0,
            duration_set: false,
            title: None,
            status_visible: false,
            progress_visible: false,
            toasts: VecDeque::new(),
            dialog: None,
        }
    }
}

impl PresentationModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies every queued message. Returns how many were applied.
    pub fn drain(&mut self, bus_consumer: &mut Receiver<Message>) -> usize {
        let mut applied = 0;
        loop {
            match bus_consumer.try_recv() {
                Ok(message) => {
                    self.apply(&message);
                    applied += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("PresentationModel: bus lagged by {} messages", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return applied,
            }
        }
    }

    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::Discovery(DiscoveryMessage::DevicesUpdated(devices)) => {
                self.devices = devices.clone();
            }
            Message::Session(SessionMessage::StateChanged { state, device }) => {
                self.session_state = *state;
                self.connected = match state {
                    SessionState::Connected | SessionState::Disconnecting => device.clone(),
                    SessionState::Connecting | SessionState::Disconnected => None,
                };
                if *state == SessionState::Disconnected {
                    self.reset_media();
                }
            }
            Message::Status(StatusMessage::StatusChanged { status, .. })
            | Message::Status(StatusMessage::StatusSnapshot(status)) => self.apply_status(*status),
            Message::Status(StatusMessage::DurationUpdated(duration_ms)) => {
                self.duration_ms = *duration_ms;
                self.duration_set = true;
                self.progress_visible = true;
            }
            Message::Status(StatusMessage::DurationReset) => self.reset_duration(),
            Message::Status(StatusMessage::TitleUpdated(title)) => {
                self.title = Some(title.clone());
                self.status_visible = true;
            }
            Message::Status(StatusMessage::TitleReset) => self.title = None,
            Message::Status(StatusMessage::SessionReset) => self.reset_media(),
            Message::Notification(NotificationMessage::Toast(text)) => {
                if self.toasts.len() >= MAX_PENDING_TOASTS {
                    self.toasts.pop_front();
                }
                self.toasts.push_back(text.clone());
            }
            Message::Notification(NotificationMessage::ErrorDialog { title, message }) => {
                self.dialog = Some(ErrorDialog {
                    title: title.clone(),
                    message: message.clone(),
                });
            }
            _ => {}
        }
    }

    fn apply_status(&mut self, status: Status) {
        self.status = status;
        // NoSource keeps whatever text was shown last.
        if let Some(text) = status_text(status.state) {
            self.status_text = Some(text);
        }
        match status.state {
            MediaState::Playing | MediaState::Paused => {
                self.progress_visible = true;
                self.status_visible = true;
            }
            MediaState::Finished => self.reset_duration(),
            _ => {}
        }
    }

    fn reset_duration(&mut self) {
        self.duration_ms = 0;
        self.duration_set = false;
    }

    fn reset_media(&mut self) {
        self.status = Status::default();
        self.status_text = None;
        self.title = None;
        self.status_visible = false;
        self.progress_visible = false;
        self.reset_duration();
    }

    /// Device picker is shown only when at least one receiver is present.
    pub fn picker_visible(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn picker_entries(&self) -> Vec<&str> {
        self.devices.iter().map(|device| device.name.as_str()).collect()
    }

    pub fn controls_enabled(&self) -> bool {
        self.connected.is_some() && !self.devices.is_empty()
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn connected_device(&self) -> Option<&DeviceSummary> {
        self.connected.as_ref()
    }

    /// Connect request for the picker row at `index`.
    pub fn connect_request(&self, index: usize) -> Option<Message> {
        self.devices.get(index).map(|device| {
            Message::Session(SessionMessage::Connect {
                device_id: device.id.clone(),
            })
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn status_text(&self) -> Option<&'static str> {
        if self.status_visible {
            self.status_text
        } else {
            None
        }
    }

    pub fn title(&self) -> Option<&str> {
        if self.status_visible {
            self.title.as_deref()
        } else {
            None
        }
    }

    pub fn progress(&self) -> Option<ProgressView> {
        if !self.progress_visible {
            return None;
        }
        if self.duration_set && self.duration_ms > 0 {
            let position_ms = self.status.position_ms.max(0);
            Some(ProgressView {
                position_ms,
                max_ms: self.duration_ms,
                position_label: format_playback_time(position_ms),
                duration_label: format_playback_time(self.duration_ms),
            })
        } else {
            Some(ProgressView {
                position_ms: 0,
                max_ms: 0,
                position_label: format_playback_time(0),
                duration_label: format_playback_time(0),
            })
        }
    }

    /// Oldest first. At most `MAX_PENDING_TOASTS` are kept between calls.
    pub fn take_toasts(&mut self) -> Vec<String> {
        self.toasts.drain(..).collect()
    }

    pub fn take_dialog(&mut self) -> Option<ErrorDialog> {
        self.dialog.take()
    }
}
