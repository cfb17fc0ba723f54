//! Connection state machine for the single active receiver.
//!
//! The controller performs no I/O. The session manager asks it for a transition,
//! runs the matching remote call on a background unit, and reports the result back
//! with the ticket it was given. Results carrying a stale ticket are ignored.
//!
//! Concurrent connects are rejected: a connect is only accepted from an idle
//! `Disconnected` session, so two attaches never interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device_registry::Device;
use crate::remote::StatusListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    /// Picked by the user; attach the listener, then query status.
    User,
    /// Last used receiver reappeared; query status, then attach.
    Rejoin,
}

/// One in-flight connect, handed to the background unit that performs it.
#[derive(Clone)]
pub struct ConnectAttempt {
    pub ticket: u64,
    pub kind: ConnectKind,
    pub device: Device,
    pub listener: Arc<dyn StatusListener>,
}

impl fmt::Debug for ConnectAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectAttempt")
            .field("ticket", &self.ticket)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .finish()
    }
}

/// The connected receiver together with the listener attached to it.
#[derive(Clone)]
pub struct ActiveSession {
    /// Ticket of the connect that produced this session.
    pub epoch: u64,
    pub device: Device,
    pub listener: Arc<dyn StatusListener>,
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("epoch", &self.epoch)
            .field("device", &self.device)
            .finish()
    }
}

/// Why a connect was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRejected {
    Busy(SessionState),
    AlreadyConnected,
}

#[derive(Debug)]
pub enum ConnectCompletion {
    Promoted(ActiveSession),
    /// The attempt was abandoned or superseded. A recorded attempt is returned so
    /// its listener can be detached.
    Stale(Option<ConnectAttempt>),
}

/// Detach work handed to a background unit.
#[derive(Debug, Clone)]
pub struct DetachRequest {
    pub ticket: u64,
    pub session: ActiveSession,
}

#[derive(Debug)]
pub struct SessionController {
    state: SessionState,
    next_ticket: u64,
    pending_connect: Option<ConnectAttempt>,
    pending_detach: Option<u64>,
    active: Option<ActiveSession>,
    abandoned: HashMap<u64, ConnectAttempt>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            next_ticket: 1,
            pending_connect: None,
            pending_detach: None,
            active: None,
            abandoned: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn connected_device(&self) -> Option<&Device> {
        self.active.as_ref().map(|session| &session.device)
    }

    /// Epoch of the connected session, used to drop results of older sessions.
    pub fn epoch(&self) -> Option<u64> {
        self.active.as_ref().map(|session| session.epoch)
    }

    pub fn pending_connect(&self) -> Option<&ConnectAttempt> {
        self.pending_connect.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    fn issue_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// `Disconnected -> Connecting`. `make_listener` receives the new ticket so the
    /// listener can tag its pushes with the session epoch.
    pub fn begin_connect<F>(
        &mut self,
        device: Device,
        kind: ConnectKind,
        make_listener: F,
    ) -> Result<ConnectAttempt, ConnectRejected>
    where
        F: FnOnce(u64) -> Arc<dyn StatusListener>,
    {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Connected => return Err(ConnectRejected::AlreadyConnected),
            busy => return Err(ConnectRejected::Busy(busy)),
        }
        let ticket = self.issue_ticket();
        let attempt = ConnectAttempt {
            ticket,
            kind,
            device,
            listener: make_listener(ticket),
        };
        self.pending_connect = Some(attempt.clone());
        self.state = SessionState::Connecting;
        Ok(attempt)
    }

    /// `Connecting -> Connected` for the matching ticket.
    pub fn complete_connect(&mut self, ticket: u64) -> ConnectCompletion {
        let matches = self
            .pending_connect
            .as_ref()
            .is_some_and(|attempt| attempt.ticket == ticket);
        if !matches {
            return ConnectCompletion::Stale(self.abandoned.remove(&ticket));
        }
        let Some(attempt) = self.pending_connect.take() else {
            return ConnectCompletion::Stale(None);
        };
        let session = ActiveSession {
            epoch: attempt.ticket,
            device: attempt.device,
            listener: attempt.listener,
        };
        self.active = Some(session.clone());
        self.state = SessionState::Connected;
        ConnectCompletion::Promoted(session)
    }

    /// `Connecting -> Disconnected` for the matching ticket. Returns the failed attempt.
    pub fn fail_connect(&mut self, ticket: u64) -> Option<ConnectAttempt> {
        if self
            .pending_connect
            .as_ref()
            .is_some_and(|attempt| attempt.ticket == ticket)
        {
            self.state = SessionState::Disconnected;
            return self.pending_connect.take();
        }
        self.abandoned.remove(&ticket);
        None
    }

    /// `Connected -> Disconnecting`. The session stays active until the detach finishes.
    pub fn begin_disconnect(&mut self) -> Option<DetachRequest> {
        if self.state != SessionState::Connected {
            return None;
        }
        let session = self.active.clone()?;
        let ticket = self.issue_ticket();
        self.pending_detach = Some(ticket);
        self.state = SessionState::Disconnecting;
        Some(DetachRequest { ticket, session })
    }

    /// `Disconnecting -> Disconnected` regardless of the detach outcome.
    pub fn finish_disconnect(&mut self, ticket: u64) -> Option<ActiveSession> {
        if self.pending_detach != Some(ticket) {
            return None;
        }
        self.pending_detach = None;
        self.state = SessionState::Disconnected;
        self.active.take()
    }

    /// Clears every transition and returns the session that was active, if any.
    ///
    /// A pending connect is recorded as abandoned so a late successful attach can
    /// still be detached.
    pub fn force_disconnect(&mut self) -> Option<ActiveSession> {
        if let Some(attempt) = self.pending_connect.take() {
            self.abandoned.insert(attempt.ticket, attempt);
        }
        self.pending_detach = None;
        self.state = SessionState::Disconnected;
        self.active.take()
    }

    /// Abandons a pending connect targeting `device_id`.
    pub fn abandon_pending_for(&mut self, device_id: &str) -> bool {
        let targets_device = self
            .pending_connect
            .as_ref()
            .is_some_and(|attempt| attempt.device.matches_id(device_id));
        if !targets_device {
            return false;
        }
        if let Some(attempt) = self.pending_connect.take() {
            self.abandoned.insert(attempt.ticket, attempt);
        }
        self.state = SessionState::Disconnected;
        true
    }

    pub fn is_connected_to(&self, device_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|session| session.device.matches_id(device_id))
    }
}
