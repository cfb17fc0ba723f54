//! Owning context for the device registry, the session and the transport policy.
//!
//! All state transitions happen on the thread running `run()`. Remote calls are
//! handed to background units that post exactly one result message back on the
//! bus; results are matched against the ticket or epoch they were issued for and
//! dropped when the session has moved on.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::catalog::MediaItem;
use crate::config::Config;
use crate::device_registry::{Device, DeviceRegistry, FoundOutcome};
use crate::error::FlingError;
use crate::protocol::{
    DiscoveryMessage, Message, NotificationMessage, SessionMessage, StatusMessage,
    TransportMessage,
};
use crate::remote::{MediaState, PlayerStatus, StatusListener};
use crate::remote_call::{call_with_timeout, TaskSpawner};
use crate::session::{
    ConnectAttempt, ConnectCompletion, ConnectKind, ConnectRejected, SessionController,
    SessionState,
};
use crate::state_persistence::LastPlayerStore;
use crate::status::{BusStatusListener, StatusStore};
use crate::transport::{
    FailureVerdict, QueryValue, TransportCommand, TransportFacade, TransportQuery,
};

pub const COMMUNICATION_ERROR_TITLE: &str = "Communication Error";
pub const CONNECTION_ERROR_MESSAGE: &str =
    "Problem with connection. Try again and check the target player.";
const STATUS_QUERY_FAILURE: &str = "Error retrieving status";
const FLING_TOAST: &str = "try Flinging...";

/// Drives discovery events, user intents and remote-call results.
pub struct SessionManager {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    registry: Arc<DeviceRegistry>,
    status: Arc<StatusStore>,
    session: SessionController,
    transport: TransportFacade,
    last_player: LastPlayerStore,
    last_player_id: Option<String>,
    spawner: Arc<dyn TaskSpawner>,
    detach_timeout: Duration,
    shutdown_requested: bool,
}

impl SessionManager {
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        registry: Arc<DeviceRegistry>,
        status: Arc<StatusStore>,
        last_player: LastPlayerStore,
        spawner: Arc<dyn TaskSpawner>,
        config: &Config,
    ) -> Self {
        let last_player_id = last_player.load();
        Self {
            bus_consumer,
            bus_producer,
            registry,
            status,
            session: SessionController::new(),
            transport: TransportFacade::new(&config.transport),
            last_player,
            last_player_id,
            spawner,
            detach_timeout: Duration::from_millis(config.session.detach_timeout_ms),
            shutdown_requested: false,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn connected_device(&self) -> Option<&Device> {
        self.session.connected_device()
    }

    pub fn last_player_id(&self) -> Option<&str> {
        self.last_player_id.as_deref()
    }

    pub fn error_count(&self) -> u32 {
        self.transport.error_count()
    }

    fn post(&self, message: Message) {
        if self.bus_producer.send(message).is_err() {
            debug!("SessionManager: no bus receivers");
        }
    }

    fn notify(&self, notification: NotificationMessage) {
        self.post(Message::Notification(notification));
    }

    fn toast(&self, text: impl Into<String>) {
        self.notify(NotificationMessage::Toast(text.into()));
    }

    fn show_error_dialog(&self, message: impl Into<String>) {
        self.notify(NotificationMessage::ErrorDialog {
            title: COMMUNICATION_ERROR_TITLE.to_string(),
            message: message.into(),
        });
    }

    fn emit_state(&self) {
        let state = self.session.state();
        let device = match state {
            SessionState::Connecting => self
                .session
                .pending_connect()
                .map(|attempt| attempt.device.summary()),
            SessionState::Connected | SessionState::Disconnecting => {
                self.session.connected_device().map(Device::summary)
            }
            SessionState::Disconnected => None,
        };
        self.post(Message::Session(SessionMessage::StateChanged { state, device }));
    }

    fn emit_devices(&self) {
        self.post(Message::Discovery(DiscoveryMessage::DevicesUpdated(
            self.registry.sorted_summaries(),
        )));
    }

    fn emit_status_snapshot(&self) {
        self.post(Message::Status(StatusMessage::StatusSnapshot(
            self.status.snapshot(),
        )));
    }

    fn reset_session_state(&mut self) {
        self.status.deactivate();
        self.transport.reset_session();
        self.post(Message::Status(StatusMessage::SessionReset));
    }

    fn spawn_connect(&mut self, attempt: ConnectAttempt) {
        let bus_producer = self.bus_producer.clone();
        let ticket = attempt.ticket;
        let kind = attempt.kind;
        let label = match kind {
            ConnectKind::User => "connect",
            ConnectKind::Rejoin => "rejoin",
        };
        let spawned = self.spawner.spawn(
            label,
            Box::new(move || {
                let player = attempt.device.player();
                let message = match attempt.kind {
                    ConnectKind::User => SessionMessage::ConnectFinished {
                        ticket: attempt.ticket,
                        result: player.add_status_listener(Arc::clone(&attempt.listener)),
                    },
                    ConnectKind::Rejoin => {
                        let result = player.status().and_then(|status| {
                            player.add_status_listener(Arc::clone(&attempt.listener))?;
                            Ok(status)
                        });
                        SessionMessage::RejoinFinished {
                            ticket: attempt.ticket,
                            result,
                        }
                    }
                };
                let _ = bus_producer.send(Message::Session(message));
            }),
        );
        if let Err(err) = spawned {
            match kind {
                ConnectKind::User => self.on_connect_finished(ticket, Err(err)),
                ConnectKind::Rejoin => self.on_rejoin_finished(ticket, Err(err)),
            }
        }
    }

    /// Fire-and-forget detach; the outcome is only logged.
    fn spawn_best_effort_detach(&self, device: Device, listener: Arc<dyn StatusListener>) {
        let name = device.name().to_string();
        let spawned = self.spawner.spawn(
            "detach",
            Box::new(move || {
                if let Err(err) = device.player().remove_status_listener(listener) {
                    warn!(
                        "SessionManager: best-effort detach from {} failed: {}",
                        device.name(),
                        err
                    );
                }
            }),
        );
        if let Err(err) = spawned {
            warn!("SessionManager: skipped detach from {}: {}", name, err);
        }
    }

    fn spawn_command(&mut self, command: TransportCommand) {
        let Some(active) = self.session.active() else {
            debug!("SessionManager: ignoring {} without a session", command.label());
            return;
        };
        let epoch = active.epoch;
        let player = Arc::clone(active.device.player());
        let bus_producer = self.bus_producer.clone();
        let label = command.label();
        let unit_command = command.clone();
        debug!("SessionManager: issuing {}", label);
        let spawned = self.spawner.spawn(
            label,
            Box::new(move || {
                let result = unit_command.execute(player.as_ref());
                let _ = bus_producer.send(Message::Transport(TransportMessage::CommandFinished {
                    epoch,
                    command: unit_command,
                    result,
                }));
            }),
        );
        if let Err(err) = spawned {
            self.on_command_finished(epoch, command, Err(err));
        }
    }

    fn spawn_query(&mut self, query: TransportQuery) {
        let Some(active) = self.session.active() else {
            return;
        };
        let epoch = active.epoch;
        let generation = self.transport.media_generation();
        let player = Arc::clone(active.device.player());
        let bus_producer = self.bus_producer.clone();
        let spawned = self.spawner.spawn(
            query.label(),
            Box::new(move || {
                let result = query.execute(player.as_ref());
                let _ = bus_producer.send(Message::Transport(TransportMessage::QueryFinished {
                    epoch,
                    generation,
                    query,
                    result,
                }));
            }),
        );
        if let Err(err) = spawned {
            self.on_query_finished(epoch, generation, query, Err(err));
        }
    }

    fn spawn_status_query(&mut self) {
        let Some(active) = self.session.active() else {
            return;
        };
        let epoch = active.epoch;
        let player = Arc::clone(active.device.player());
        let bus_producer = self.bus_producer.clone();
        let spawned = self.spawner.spawn(
            "status",
            Box::new(move || {
                let result = player.status();
                let _ = bus_producer.send(Message::Session(SessionMessage::StatusQueried {
                    epoch,
                    result,
                }));
            }),
        );
        if let Err(err) = spawned {
            self.on_status_queried(epoch, Err(err));
        }
    }

    /// Clears the session without waiting for the remote side.
    fn teardown_session(&mut self, reason: &str) {
        if let Some(ended) = self.session.force_disconnect() {
            info!(
                "SessionManager: tearing down session with {} ({})",
                ended.device.name(),
                reason
            );
            self.spawn_best_effort_detach(ended.device, ended.listener);
        }
        self.reset_session_state();
        self.emit_state();
    }

    fn handle_failure(&mut self, message: String) {
        match self.transport.record_failure(message) {
            FailureVerdict::Absorbed { count } => {
                debug!("SessionManager: absorbed failure {}", count);
            }
            FailureVerdict::Escalate { message } => {
                error!("SessionManager: too many failures, disconnecting: {}", message);
                self.show_error_dialog(message);
                self.teardown_session("communication error");
            }
        }
    }

    fn apply_backfill(&mut self, state: MediaState) {
        let backfill = self.transport.backfill(state);
        if backfill.reset_duration {
            self.post(Message::Status(StatusMessage::DurationReset));
        }
        for query in backfill.queries {
            self.spawn_query(query);
        }
    }

    fn on_device_found(&mut self, device: Device) {
        let outcome = self.registry.on_device_found(device.clone());
        if outcome == FoundOutcome::Updated {
            debug!("SessionManager: {} re-announced", device.name());
        }
        let rejoin_candidate = self.session.is_idle()
            && self
                .last_player_id
                .as_deref()
                .is_some_and(|last_id| device.matches_id(last_id));
        if rejoin_candidate {
            info!("SessionManager: rejoining last player {}", device.name());
            self.begin_connect(device, ConnectKind::Rejoin);
        }
        self.emit_devices();
    }

    fn on_device_lost(&mut self, device: Device) {
        if self.session.is_connected_to(device.id()) {
            self.teardown_session("device lost");
        } else if self.session.abandon_pending_for(device.id()) {
            info!(
                "SessionManager: abandoned pending connect to lost {}",
                device.name()
            );
            self.emit_state();
        }
        if self.registry.on_device_lost(&device).is_some() {
            self.emit_devices();
        }
    }

    fn begin_connect(&mut self, device: Device, kind: ConnectKind) {
        let status = Arc::clone(&self.status);
        let bus_producer = self.bus_producer.clone();
        let result = self.session.begin_connect(device, kind, move |ticket| {
            Arc::new(BusStatusListener::new(ticket, status, bus_producer)) as Arc<dyn StatusListener>
        });
        match result {
            Ok(attempt) => {
                self.emit_state();
                self.spawn_connect(attempt);
            }
            Err(rejected) => {
                if kind == ConnectKind::User {
                    let text = match rejected {
                        ConnectRejected::Busy(_) => "Connection in progress, try again later",
                        ConnectRejected::AlreadyConnected => {
                            "Disconnect from the current player first"
                        }
                    };
                    self.toast(text);
                }
                debug!("SessionManager: connect rejected: {:?}", rejected);
            }
        }
    }

    fn on_connect_requested(&mut self, device_id: &str) {
        let Some(device) = self.registry.get(device_id) else {
            warn!("SessionManager: connect target {} not found", device_id);
            self.toast("Selected player was not found.");
            return;
        };
        self.begin_connect(device, ConnectKind::User);
    }

    fn on_connect_finished(&mut self, ticket: u64, result: Result<(), FlingError>) {
        match result {
            Ok(()) => match self.session.complete_connect(ticket) {
                ConnectCompletion::Promoted(active) => {
                    info!("SessionManager: connected to {}", active.device.name());
                    self.status.activate(active.epoch);
                    self.transport.reset_errors();
                    self.transport.reset_session();
                    self.emit_state();
                    self.spawn_status_query();
                }
                ConnectCompletion::Stale(abandoned) => self.drop_stale_attach(ticket, abandoned),
            },
            Err(err) => {
                if self.session.fail_connect(ticket).is_some() {
                    warn!("SessionManager: connect failed: {}", err);
                    self.show_error_dialog(CONNECTION_ERROR_MESSAGE);
                    self.reset_session_state();
                    self.emit_state();
                } else {
                    debug!("SessionManager: ignoring stale connect failure {}", ticket);
                }
            }
        }
    }

    fn on_rejoin_finished(&mut self, ticket: u64, result: Result<PlayerStatus, FlingError>) {
        match result {
            Ok(player_status) => match self.session.complete_connect(ticket) {
                ConnectCompletion::Promoted(active) => {
                    info!("SessionManager: rejoined {}", active.device.name());
                    self.status.activate(active.epoch);
                    self.status.apply_queried(active.epoch, player_status);
                    self.transport.reset_errors();
                    self.transport.reset_session();
                    self.emit_state();
                    self.emit_status_snapshot();
                    self.apply_backfill(player_status.state);
                }
                ConnectCompletion::Stale(abandoned) => self.drop_stale_attach(ticket, abandoned),
            },
            Err(err) => {
                if self.session.fail_connect(ticket).is_some() {
                    info!("SessionManager: skip rejoin: {}", err);
                    self.emit_state();
                }
            }
        }
    }

    fn drop_stale_attach(&self, ticket: u64, abandoned: Option<ConnectAttempt>) {
        match abandoned {
            Some(attempt) => {
                info!(
                    "SessionManager: detaching stale attach to {}",
                    attempt.device.name()
                );
                self.spawn_best_effort_detach(attempt.device, attempt.listener);
            }
            None => debug!("SessionManager: ignoring stale connect result {}", ticket),
        }
    }

    fn on_disconnect_requested(&mut self) {
        // An explicit disconnect also forgets the rejoin target for this run.
        self.last_player_id = None;
        let Some(request) = self.session.begin_disconnect() else {
            debug!("SessionManager: nothing to disconnect");
            return;
        };
        self.emit_state();
        let bus_producer = self.bus_producer.clone();
        let ticket = request.ticket;
        let spawned = self.spawner.spawn(
            "disconnect",
            Box::new(move || {
                let result = request
                    .session
                    .device
                    .player()
                    .remove_status_listener(Arc::clone(&request.session.listener));
                let _ = bus_producer.send(Message::Session(SessionMessage::DisconnectFinished {
                    ticket: request.ticket,
                    result,
                }));
            }),
        );
        if let Err(err) = spawned {
            self.on_disconnect_finished(ticket, Err(err));
        }
    }

    fn on_disconnect_finished(&mut self, ticket: u64, result: Result<(), FlingError>) {
        if let Err(err) = result {
            warn!("SessionManager: detach failed, disconnecting anyway: {}", err);
        }
        if let Some(ended) = self.session.finish_disconnect(ticket) {
            info!("SessionManager: disconnected from {}", ended.device.name());
            self.reset_session_state();
            self.emit_state();
        }
    }

    fn on_status_queried(&mut self, epoch: u64, result: Result<PlayerStatus, FlingError>) {
        if self.session.epoch() != Some(epoch) {
            debug!("SessionManager: dropping status for stale session {}", epoch);
            return;
        }
        match result {
            Ok(player_status) => {
                self.transport.record_success();
                if self.status.apply_queried(epoch, player_status).is_some() {
                    self.emit_status_snapshot();
                    self.apply_backfill(player_status.state);
                }
            }
            Err(err) => {
                warn!("SessionManager: {}: {}", STATUS_QUERY_FAILURE, err);
                self.handle_failure(STATUS_QUERY_FAILURE.to_string());
            }
        }
    }

    fn handle_app_pausing(&mut self) {
        let persisted = if self.session.state() == SessionState::Connected {
            self.session.active().cloned()
        } else {
            None
        };
        let ended = self.session.force_disconnect();

        match persisted {
            Some(active) => {
                let player_id = active.device.id().to_string();
                if let Err(err) = self.last_player.store(&player_id) {
                    warn!("SessionManager: failed to store last player: {}", err);
                }
                self.last_player_id = Some(player_id);
                let player = Arc::clone(active.device.player());
                let listener = Arc::clone(&active.listener);
                match call_with_timeout("remove_status_listener", self.detach_timeout, move || {
                    player.remove_status_listener(listener)
                }) {
                    Ok(()) => info!("SessionManager: detached before pause"),
                    Err(err) => warn!("SessionManager: detach on pause abandoned: {}", err),
                }
            }
            None => {
                if let Err(err) = self.last_player.clear() {
                    warn!("SessionManager: failed to clear last player: {}", err);
                }
                self.last_player_id = None;
                if let Some(ended) = ended {
                    self.spawn_best_effort_detach(ended.device, ended.listener);
                }
            }
        }

        self.registry.clear();
        self.reset_session_state();
        self.emit_state();
        self.emit_devices();
        self.post(Message::Session(SessionMessage::Paused));
    }

    fn handle_resume(&mut self) {
        self.last_player_id = self.last_player.load();
        self.transport.reset_errors();
        info!(
            "SessionManager: resumed, last player id={:?}",
            self.last_player_id
        );
    }

    fn fling(&mut self, item: &MediaItem) {
        if self.session.active().is_none() {
            debug!("SessionManager: fling without a session");
            return;
        }
        info!("SessionManager: flinging {}", item.title);
        self.status.clear();
        self.transport.reset_duration();
        self.transport.reset_title();
        self.emit_status_snapshot();
        self.post(Message::Status(StatusMessage::DurationReset));
        self.post(Message::Status(StatusMessage::TitleReset));
        for command in self.transport.fling_commands(item) {
            self.spawn_command(command);
        }
        self.toast(FLING_TOAST);
    }

    fn on_command_finished(
        &mut self,
        epoch: u64,
        command: TransportCommand,
        result: Result<(), FlingError>,
    ) {
        if self.session.epoch() != Some(epoch) {
            debug!(
                "SessionManager: dropping {} result for stale session {}",
                command.label(),
                epoch
            );
            return;
        }
        match result {
            Ok(()) => {
                self.transport.record_success();
                info!("SessionManager: {}: successful", command.label());
                self.toast(command.label());
            }
            Err(err) => {
                warn!("SessionManager: {} ({})", command.failure_message(), err);
                self.handle_failure(command.escalation_message(&err));
            }
        }
    }

    fn on_query_finished(
        &mut self,
        epoch: u64,
        generation: u64,
        query: TransportQuery,
        result: Result<QueryValue, FlingError>,
    ) {
        if self.session.epoch() != Some(epoch) {
            debug!("SessionManager: dropping {:?} for stale session", query);
            return;
        }
        if !self.transport.finish_query(query, generation) {
            debug!("SessionManager: dropping {:?} for replaced media", query);
            return;
        }
        match result {
            Ok(value) => {
                self.transport.record_success();
                match value {
                    QueryValue::Duration(duration_ms) => {
                        self.transport.apply_duration(duration_ms);
                        self.post(Message::Status(StatusMessage::DurationUpdated(duration_ms)));
                    }
                    QueryValue::Position(position_ms) => {
                        if self.status.apply_position(epoch, position_ms).is_some() {
                            self.emit_status_snapshot();
                        }
                    }
                    QueryValue::MediaTitle(Some(title)) => {
                        self.transport.apply_title(title.clone());
                        self.post(Message::Status(StatusMessage::TitleUpdated(title)));
                    }
                    QueryValue::MediaTitle(None) => {}
                }
            }
            Err(err) => {
                warn!("SessionManager: {} ({})", query.failure_message(), err);
                self.handle_failure(query.failure_message().to_string());
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Discovery(DiscoveryMessage::DeviceFound(device)) => {
                self.on_device_found(device)
            }
            Message::Discovery(DiscoveryMessage::DeviceLost(device)) => self.on_device_lost(device),
            Message::Discovery(DiscoveryMessage::DiscoveryFailure(reason)) => {
                error!("SessionManager: discovery failure: {}", reason);
            }
            Message::Session(SessionMessage::Connect { device_id }) => {
                self.on_connect_requested(&device_id)
            }
            Message::Session(SessionMessage::Disconnect) => self.on_disconnect_requested(),
            Message::Session(SessionMessage::AppPausing) => self.handle_app_pausing(),
            Message::Session(SessionMessage::Resume) => self.handle_resume(),
            Message::Session(SessionMessage::Shutdown) => {
                info!("SessionManager: shutdown requested");
                self.shutdown_requested = true;
            }
            Message::Session(SessionMessage::ConnectFinished { ticket, result }) => {
                self.on_connect_finished(ticket, result)
            }
            Message::Session(SessionMessage::RejoinFinished { ticket, result }) => {
                self.on_rejoin_finished(ticket, result)
            }
            Message::Session(SessionMessage::DisconnectFinished { ticket, result }) => {
                self.on_disconnect_finished(ticket, result)
            }
            Message::Session(SessionMessage::StatusQueried { epoch, result }) => {
                self.on_status_queried(epoch, result)
            }
            Message::Status(StatusMessage::StatusChanged { epoch, status }) => {
                if self.session.epoch() == Some(epoch) {
                    self.apply_backfill(status.state);
                }
            }
            Message::Transport(TransportMessage::Fling(item)) => self.fling(&item),
            Message::Transport(TransportMessage::PlayOrFling { selected }) => {
                match self.status.state() {
                    MediaState::Paused | MediaState::ReadyToPlay => {
                        self.spawn_command(TransportCommand::Play)
                    }
                    _ => match selected {
                        Some(item) => self.fling(&item),
                        None => info!("SessionManager: media must be selected first"),
                    },
                }
            }
            Message::Transport(TransportMessage::Play) => self.spawn_command(TransportCommand::Play),
            Message::Transport(TransportMessage::Pause) => {
                self.spawn_command(TransportCommand::Pause)
            }
            Message::Transport(TransportMessage::Stop) => {
                if self.session.active().is_some() {
                    self.spawn_command(TransportCommand::Stop);
                    self.status.clear();
                    self.transport.reset_duration();
                    self.emit_status_snapshot();
                    self.post(Message::Status(StatusMessage::DurationReset));
                }
            }
            Message::Transport(TransportMessage::Forward) => {
                let command = self.transport.forward();
                self.spawn_command(command)
            }
            Message::Transport(TransportMessage::Backward) => {
                let command = self.transport.backward();
                self.spawn_command(command)
            }
            Message::Transport(TransportMessage::SeekTo(position_ms)) => {
                let command = self.transport.seek_to(position_ms);
                self.spawn_command(command)
            }
            Message::Transport(TransportMessage::CommandFinished {
                epoch,
                command,
                result,
            }) => self.on_command_finished(epoch, command, result),
            Message::Transport(TransportMessage::QueryFinished {
                epoch,
                generation,
                query,
                result,
            }) => self.on_query_finished(epoch, generation, query, result),
            _ => {}
        }
    }

    /// Drains queued messages. Returns true once the bus closed or shutdown was requested.
    pub fn process_pending_bus_messages(&mut self) -> bool {
        loop {
            match self.bus_consumer.try_recv() {
                Ok(message) => {
                    self.handle_message(message);
                    if self.shutdown_requested {
                        return true;
                    }
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Empty) => return false,
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("SessionManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => return true,
            }
        }
    }

    /// Starts the blocking session manager loop.
    pub fn run(&mut self) {
        info!("SessionManager: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SessionManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
            if self.shutdown_requested {
                break;
            }
        }
        info!("SessionManager: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionManager, COMMUNICATION_ERROR_TITLE, CONNECTION_ERROR_MESSAGE};
    use crate::catalog::MediaItem;
    use crate::config::Config;
    use crate::device_registry::DeviceRegistry;
    use crate::protocol::{
        DiscoveryMessage, Message, NotificationMessage, SessionMessage, StatusMessage,
        TransportMessage,
    };
    use crate::remote::{MediaCondition, MediaState, PlayerStatus};
    use crate::session::SessionState;
    use crate::state_persistence::LastPlayerStore;
    use crate::status::StatusStore;
    use crate::remote_call::TaskSpawner;
    use crate::test_support::{scratch_dir, ControlledSpawner, FakePlayer, InlineSpawner, SpawnMode};
    use crate::transport::TransportCommand;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, Receiver, Sender};

    struct Harness {
        manager: SessionManager,
        bus: Sender<Message>,
        observer: Receiver<Message>,
        registry: Arc<DeviceRegistry>,
        status: Arc<StatusStore>,
        state_path: PathBuf,
        dir: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn harness(last_player: Option<&str>) -> Harness {
        harness_with_spawner(last_player, Arc::new(InlineSpawner))
    }

    fn harness_with_spawner(last_player: Option<&str>, spawner: Arc<dyn TaskSpawner>) -> Harness {
        let (bus, _) = broadcast::channel(1024);
        let observer = bus.subscribe();
        let dir = scratch_dir("session_manager");
        let state_path = dir.join("state.toml");
        let store = LastPlayerStore::new(state_path.clone());
        if let Some(id) = last_player {
            store.store(id).expect("seeding last player should succeed");
        }
        let mut config = Config::default();
        config.session.detach_timeout_ms = 200;
        let registry = Arc::new(DeviceRegistry::new());
        let status = Arc::new(StatusStore::new());
        let manager = SessionManager::new(
            bus.subscribe(),
            bus.clone(),
            Arc::clone(&registry),
            Arc::clone(&status),
            store,
            spawner,
            &config,
        );
        Harness {
            manager,
            bus,
            observer,
            registry,
            status,
            state_path,
            dir,
        }
    }

    impl Harness {
        fn send(&mut self, message: Message) {
            self.bus.send(message).expect("bus should accept message");
            self.pump();
        }

        fn pump(&mut self) {
            self.manager.process_pending_bus_messages();
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(message) = self.observer.try_recv() {
                messages.push(message);
            }
            messages
        }

        fn found(&mut self, player: &Arc<FakePlayer>) {
            self.send(Message::Discovery(DiscoveryMessage::DeviceFound(
                player.as_device(),
            )));
        }

        fn connect(&mut self, player: &Arc<FakePlayer>) {
            self.found(player);
            let id = player.as_device().id().to_string();
            self.send(Message::Session(SessionMessage::Connect { device_id: id }));
            assert_eq!(self.manager.session_state(), SessionState::Connected);
        }
    }

    fn dialogs(messages: &[Message]) -> Vec<(String, String)> {
        messages
            .iter()
            .filter_map(|message| match message {
                Message::Notification(NotificationMessage::ErrorDialog { title, message }) => {
                    Some((title.clone(), message.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn toasts(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                Message::Notification(NotificationMessage::Toast(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn sample_item() -> MediaItem {
        let mut metadata = serde_json::Map::new();
        metadata.insert("title".to_string(), serde_json::json!("Sintel"));
        MediaItem {
            title: "Sintel".to_string(),
            url: "http://media.invalid/sintel.mp4".to_string(),
            icon_url: None,
            metadata,
        }
    }

    #[test]
    fn test_found_devices_publish_sorted_view() {
        let mut harness = harness(None);
        harness.found(&FakePlayer::new("b", "Kitchen"));
        harness.found(&FakePlayer::new("a", "Bedroom"));

        let last_view = harness
            .drain()
            .into_iter()
            .filter_map(|message| match message {
                Message::Discovery(DiscoveryMessage::DevicesUpdated(view)) => Some(view),
                _ => None,
            })
            .last()
            .expect("devices update should be published");
        let names: Vec<String> = last_view.into_iter().map(|summary| summary.name).collect();
        assert_eq!(names, vec!["Bedroom", "Kitchen"]);
    }

    #[test]
    fn test_rejoin_success_connects_to_last_player() {
        let mut harness = harness(Some("Receiver-X"));
        let player = FakePlayer::new("receiver-x", "Living Room");
        player.set_status(PlayerStatus {
            state: MediaState::Paused,
            condition: MediaCondition::Good,
        });

        harness.found(&player);

        assert_eq!(harness.manager.session_state(), SessionState::Connected);
        assert_eq!(player.call_count("status"), 1);
        assert_eq!(player.listener_count(), 1);
        assert_eq!(harness.status.state(), MediaState::Paused);
        assert!(dialogs(&harness.drain()).is_empty());
    }

    #[test]
    fn test_rejoin_failure_stays_disconnected_silently() {
        let mut harness = harness(Some("X"));
        let player = FakePlayer::new("X", "Office");
        player.fail("status");

        harness.found(&player);

        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert_eq!(player.call_count("status"), 1);
        assert_eq!(player.listener_count(), 0);
        assert!(dialogs(&harness.drain()).is_empty());
        assert!(harness.registry.contains("X"));
    }

    #[test]
    fn test_rejoin_only_fires_for_matching_idle_session() {
        let mut harness = harness(Some("X"));
        let other = FakePlayer::new("Y", "Other");
        harness.connect(&other);

        let last = FakePlayer::new("x", "Last");
        harness.found(&last);
        assert_eq!(last.call_count("status"), 0);
        assert!(harness.manager.connected_device().is_some_and(|d| d.id() == "Y"));
    }

    #[test]
    fn test_user_connect_attaches_then_queries_status() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);

        assert_eq!(
            player.calls(),
            vec!["add_status_listener".to_string(), "status".to_string()]
        );
        let states: Vec<SessionState> = harness
            .drain()
            .into_iter()
            .filter_map(|message| match message {
                Message::Session(SessionMessage::StateChanged { state, .. }) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::Connecting, SessionState::Connected]);
    }

    #[test]
    fn test_connect_failure_shows_connection_dialog() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.fail("add_status_listener");
        harness.found(&player);
        harness.send(Message::Session(SessionMessage::Connect {
            device_id: "a".to_string(),
        }));

        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert_eq!(
            dialogs(&harness.drain()),
            vec![(
                COMMUNICATION_ERROR_TITLE.to_string(),
                CONNECTION_ERROR_MESSAGE.to_string()
            )]
        );
    }

    #[test]
    fn test_connect_while_connected_is_rejected() {
        let mut harness = harness(None);
        harness.connect(&FakePlayer::new("a", "Alpha"));
        let beta = FakePlayer::new("b", "Beta");
        harness.found(&beta);
        harness.drain();

        harness.send(Message::Session(SessionMessage::Connect {
            device_id: "b".to_string(),
        }));
        assert_eq!(beta.call_count("add_status_listener"), 0);
        assert_eq!(toasts(&harness.drain()).len(), 1);
        assert!(harness.manager.connected_device().is_some_and(|d| d.id() == "a"));
    }

    #[test]
    fn test_losing_connected_device_disconnects_and_detaches() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);
        harness.send(Message::Transport(TransportMessage::Play));
        harness.drain();

        harness.send(Message::Discovery(DiscoveryMessage::DeviceLost(
            player.as_device(),
        )));

        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert_eq!(player.listener_count(), 0);
        assert!(!harness.registry.contains("a"));
        let messages = harness.drain();
        let disconnected_at = messages.iter().position(|message| {
            matches!(
                message,
                Message::Session(SessionMessage::StateChanged {
                    state: SessionState::Disconnected,
                    ..
                })
            )
        });
        let removed_at = messages
            .iter()
            .position(|message| matches!(message, Message::Discovery(DiscoveryMessage::DevicesUpdated(_))));
        assert!(disconnected_at.expect("disconnect published") < removed_at.expect("removal published"));
    }

    #[test]
    fn test_five_failures_are_silent_sixth_escalates() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);
        player.fail("play");
        harness.drain();

        for _ in 0..5 {
            harness.send(Message::Transport(TransportMessage::Play));
        }
        assert!(dialogs(&harness.drain()).is_empty());
        assert_eq!(harness.manager.error_count(), 5);
        assert_eq!(harness.manager.session_state(), SessionState::Connected);

        harness.send(Message::Transport(TransportMessage::Play));
        assert_eq!(
            dialogs(&harness.drain()),
            vec![(
                COMMUNICATION_ERROR_TITLE.to_string(),
                "Error Playing".to_string()
            )]
        );
        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert_eq!(player.listener_count(), 0);
    }

    #[test]
    fn test_success_between_failures_resets_counter() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);
        player.fail("pause");
        for _ in 0..4 {
            harness.send(Message::Transport(TransportMessage::Pause));
        }
        harness.send(Message::Transport(TransportMessage::Play));
        assert_eq!(harness.manager.error_count(), 0);
        for _ in 0..5 {
            harness.send(Message::Transport(TransportMessage::Pause));
        }
        assert!(dialogs(&harness.drain()).is_empty());
        assert_eq!(harness.manager.session_state(), SessionState::Connected);
    }

    #[test]
    fn test_commands_without_session_are_noops() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.found(&player);
        harness.send(Message::Transport(TransportMessage::Play));
        harness.send(Message::Transport(TransportMessage::Stop));
        harness.send(Message::Transport(TransportMessage::Fling(sample_item())));

        assert!(player.calls().is_empty());
        assert!(toasts(&harness.drain()).is_empty());
    }

    #[test]
    fn test_stale_command_result_is_dropped() {
        let mut harness = harness(None);
        harness.connect(&FakePlayer::new("a", "Alpha"));
        harness.send(Message::Transport(TransportMessage::CommandFinished {
            epoch: 999,
            command: TransportCommand::Play,
            result: Err(crate::error::FlingError::remote("play", "late")),
        }));
        assert_eq!(harness.manager.error_count(), 0);
    }

    #[test]
    fn test_fling_sets_interval_then_source_and_toasts() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);
        harness.drain();

        harness.send(Message::Transport(TransportMessage::PlayOrFling {
            selected: Some(sample_item()),
        }));

        let calls = player.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &[
                "set_position_update_interval(1000)".to_string(),
                "set_media_source(http://media.invalid/sintel.mp4|{\"title\":\"Sintel\"})"
                    .to_string(),
            ]
        );
        let toasts = toasts(&harness.drain());
        assert!(toasts.contains(&"try Flinging...".to_string()));
        assert!(toasts.contains(&"set_media_source".to_string()));
    }

    #[test]
    fn test_play_or_fling_plays_when_paused() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.set_status(PlayerStatus {
            state: MediaState::Paused,
            condition: MediaCondition::Good,
        });
        harness.connect(&player);

        harness.send(Message::Transport(TransportMessage::PlayOrFling {
            selected: Some(sample_item()),
        }));
        assert_eq!(player.call_count("play"), 1);
        assert_eq!(player.call_count("set_media_source"), 0);
    }

    #[test]
    fn test_stop_clears_status_and_duration() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.set_duration(120_000);
        harness.connect(&player);
        player.push_status(
            PlayerStatus {
                state: MediaState::Playing,
                condition: MediaCondition::Good,
            },
            4_000,
        );
        harness.pump();
        harness.drain();

        harness.send(Message::Transport(TransportMessage::Stop));

        assert_eq!(player.call_count("stop"), 1);
        assert_eq!(harness.status.snapshot().position_ms, -1);
        assert_eq!(harness.status.state(), MediaState::NoSource);
        assert!(harness
            .drain()
            .iter()
            .any(|message| matches!(message, Message::Status(StatusMessage::DurationReset))));
    }

    #[test]
    fn test_ready_to_play_backfills_duration_and_title() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.set_duration(90_000);
        player.set_metadata(r#"{"title":"Sintel"}"#);
        harness.connect(&player);
        harness.drain();

        player.push_status(
            PlayerStatus {
                state: MediaState::ReadyToPlay,
                condition: MediaCondition::Good,
            },
            0,
        );
        harness.pump();

        let messages = harness.drain();
        assert!(messages
            .iter()
            .any(|message| matches!(message, Message::Status(StatusMessage::DurationUpdated(90_000)))));
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Status(StatusMessage::TitleUpdated(title)) if title == "Sintel"
        )));

        player.push_status(
            PlayerStatus {
                state: MediaState::Playing,
                condition: MediaCondition::Good,
            },
            1_000,
        );
        harness.pump();
        assert_eq!(player.call_count("duration"), 1);
        assert_eq!(player.call_count("media_info"), 1);
    }

    #[test]
    fn test_seek_to_is_clamped_to_known_duration() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.set_duration(30_000);
        harness.connect(&player);
        player.push_status(
            PlayerStatus {
                state: MediaState::Playing,
                condition: MediaCondition::Good,
            },
            0,
        );
        harness.pump();

        harness.send(Message::Transport(TransportMessage::SeekTo(45_000)));
        assert!(player.calls().contains(&"seek(Absolute,30000)".to_string()));
    }

    #[test]
    fn test_disconnect_detaches_and_resets() {
        let mut harness = harness(Some("a"));
        let player = FakePlayer::new("a", "Alpha");
        harness.found(&player);
        assert_eq!(harness.manager.session_state(), SessionState::Connected);

        harness.send(Message::Session(SessionMessage::Disconnect));

        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert_eq!(player.listener_count(), 0);
        assert_eq!(harness.manager.last_player_id(), None);
        assert!(harness
            .drain()
            .iter()
            .any(|message| matches!(message, Message::Status(StatusMessage::SessionReset))));
    }

    #[test]
    fn test_app_pausing_persists_last_player_and_cleans() {
        let mut harness = harness(None);
        let player = FakePlayer::new("Receiver-1", "Den");
        harness.connect(&player);
        harness.drain();

        harness.send(Message::Session(SessionMessage::AppPausing));

        assert_eq!(player.listener_count(), 0);
        assert!(harness.registry.is_empty());
        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        let stored = LastPlayerStore::new(harness.state_path.clone()).load();
        assert_eq!(stored, Some("Receiver-1".to_string()));
        assert!(harness
            .drain()
            .iter()
            .any(|message| matches!(message, Message::Session(SessionMessage::Paused))));
    }

    #[test]
    fn test_app_pausing_without_session_clears_last_player() {
        let mut harness = harness(Some("gone"));
        harness.send(Message::Session(SessionMessage::AppPausing));
        assert_eq!(LastPlayerStore::new(harness.state_path.clone()).load(), None);

        harness.send(Message::Session(SessionMessage::Resume));
        assert_eq!(harness.manager.last_player_id(), None);
    }

    #[test]
    fn test_pause_detach_wait_is_bounded() {
        let mut harness = harness(None);
        let player = FakePlayer::new("slow", "Slow");
        harness.connect(&player);
        player.set_remove_delay(Duration::from_millis(1_500));

        let started = Instant::now();
        harness.send(Message::Session(SessionMessage::AppPausing));

        assert!(started.elapsed() < Duration::from_millis(1_200));
        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert!(harness.manager.connected_device().is_none());
    }

    #[test]
    fn test_replaced_media_requeries_duration_for_seek_clamp() {
        let spawner = ControlledSpawner::new(SpawnMode::Inline);
        let mut harness = harness_with_spawner(None, spawner.clone());
        let player = FakePlayer::new("a", "Alpha");
        player.set_duration(100_000);
        harness.connect(&player);

        spawner.set_mode(SpawnMode::Defer);
        player.push_status(
            PlayerStatus {
                state: MediaState::Playing,
                condition: MediaCondition::Good,
            },
            0,
        );
        harness.pump();
        harness.send(Message::Transport(TransportMessage::Fling(sample_item())));
        player.push_status(
            PlayerStatus {
                state: MediaState::ReadyToPlay,
                condition: MediaCondition::Good,
            },
            0,
        );
        harness.pump();

        let duration_units = spawner
            .queued_labels()
            .iter()
            .filter(|label| label.as_str() == "duration")
            .count();
        assert_eq!(duration_units, 2);

        // Units for the previous media and the fling commands land first.
        for _ in 0..4 {
            spawner.run_next();
        }
        player.set_duration(30_000);
        spawner.run_all();
        harness.pump();

        spawner.set_mode(SpawnMode::Inline);
        harness.send(Message::Transport(TransportMessage::SeekTo(60_000)));
        assert_eq!(player.call_count("duration"), 2);
        assert!(player
            .calls()
            .contains(&"seek(Absolute,30000)".to_string()));
    }

    #[test]
    fn test_connect_spawn_failure_returns_to_disconnected() {
        let spawner = ControlledSpawner::new(SpawnMode::Fail);
        let mut harness = harness_with_spawner(None, spawner.clone());
        let player = FakePlayer::new("a", "Alpha");
        harness.found(&player);
        harness.drain();

        for _ in 0..2 {
            harness.send(Message::Session(SessionMessage::Connect {
                device_id: "a".to_string(),
            }));
            assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        }
        let messages = harness.drain();
        assert_eq!(
            dialogs(&messages),
            vec![
                (
                    COMMUNICATION_ERROR_TITLE.to_string(),
                    CONNECTION_ERROR_MESSAGE.to_string()
                );
                2
            ]
        );
        assert!(toasts(&messages).is_empty());

        spawner.set_mode(SpawnMode::Inline);
        harness.send(Message::Session(SessionMessage::Connect {
            device_id: "a".to_string(),
        }));
        assert_eq!(harness.manager.session_state(), SessionState::Connected);
    }

    #[test]
    fn test_rejoin_spawn_failure_leaves_session_idle() {
        let spawner = ControlledSpawner::new(SpawnMode::Fail);
        let mut harness = harness_with_spawner(Some("a"), spawner.clone());
        let player = FakePlayer::new("a", "Alpha");
        harness.found(&player);
        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert!(dialogs(&harness.drain()).is_empty());

        spawner.set_mode(SpawnMode::Inline);
        harness.found(&player);
        assert_eq!(harness.manager.session_state(), SessionState::Connected);
    }

    #[test]
    fn test_disconnect_spawn_failure_still_disconnects() {
        let spawner = ControlledSpawner::new(SpawnMode::Inline);
        let mut harness = harness_with_spawner(None, spawner.clone());
        harness.connect(&FakePlayer::new("a", "Alpha"));

        spawner.set_mode(SpawnMode::Fail);
        harness.send(Message::Session(SessionMessage::Disconnect));
        assert_eq!(harness.manager.session_state(), SessionState::Disconnected);
        assert!(harness.manager.connected_device().is_none());
    }

    #[test]
    fn test_command_spawn_failure_counts_toward_error_window() {
        let spawner = ControlledSpawner::new(SpawnMode::Inline);
        let mut harness = harness_with_spawner(None, spawner.clone());
        harness.connect(&FakePlayer::new("a", "Alpha"));

        spawner.set_mode(SpawnMode::Fail);
        harness.send(Message::Transport(TransportMessage::Play));
        assert_eq!(harness.manager.error_count(), 1);
        assert_eq!(harness.manager.session_state(), SessionState::Connected);
    }

    #[test]
    fn test_paused_without_duration_backfills_position() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        player.set_duration(50_000);
        player.set_position(42_000);
        harness.connect(&player);

        player.push_status(
            PlayerStatus {
                state: MediaState::Paused,
                condition: MediaCondition::Good,
            },
            0,
        );
        harness.pump();

        assert_eq!(player.call_count("position"), 1);
        assert_eq!(harness.status.snapshot().position_ms, 42_000);
    }

    #[test]
    fn test_recovered_command_clears_error_window() {
        let mut harness = harness(None);
        let player = FakePlayer::new("a", "Alpha");
        harness.connect(&player);
        player.fail("play");
        for _ in 0..5 {
            harness.send(Message::Transport(TransportMessage::Play));
        }
        assert_eq!(harness.manager.error_count(), 5);

        player.succeed("play");
        harness.send(Message::Transport(TransportMessage::Play));
        assert_eq!(harness.manager.error_count(), 0);
        assert!(toasts(&harness.drain()).contains(&"play".to_string()));
    }
}
