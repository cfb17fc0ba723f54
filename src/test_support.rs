//! Fakes shared by unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device_registry::Device;
use crate::error::FlingError;
use crate::remote::{
    MediaPlayerInfo, MediaSourceFlags, PlayerStatus, RemotePlayer, RemoteResult, SeekMode,
    StatusListener,
};
use crate::remote_call::TaskSpawner;

/// Runs background units immediately on the calling thread.
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, _label: &str, task: Box<dyn FnOnce() + Send + 'static>) -> RemoteResult<()> {
        task();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Inline,
    /// Queue units until `run_next`/`run_all`.
    Defer,
    /// Refuse every unit, as if no thread could be created.
    Fail,
}

type QueuedUnit = (String, Box<dyn FnOnce() + Send + 'static>);

struct ControlledState {
    mode: SpawnMode,
    queued: VecDeque<QueuedUnit>,
}

/// Spawner whose behavior can be switched mid-test.
pub struct ControlledSpawner {
    state: Mutex<ControlledState>,
}

impl ControlledSpawner {
    pub fn new(mode: SpawnMode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlledState {
                mode,
                queued: VecDeque::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlledState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_mode(&self, mode: SpawnMode) {
        self.lock().mode = mode;
    }

    pub fn queued_labels(&self) -> Vec<String> {
        self.lock()
            .queued
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Runs the oldest queued unit. Returns its label.
    pub fn run_next(&self) -> Option<String> {
        let (label, task) = self.lock().queued.pop_front()?;
        task();
        Some(label)
    }

    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next().is_some() {
            ran += 1;
        }
        ran
    }
}

impl TaskSpawner for ControlledSpawner {
    fn spawn(&self, label: &str, task: Box<dyn FnOnce() + Send + 'static>) -> RemoteResult<()> {
        let mode = self.lock().mode;
        match mode {
            SpawnMode::Inline => {
                task();
                Ok(())
            }
            SpawnMode::Defer => {
                self.lock().queued.push_back((label.to_string(), task));
                Ok(())
            }
            SpawnMode::Fail => Err(FlingError::remote(label, "no thread available")),
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    failing: HashSet<String>,
    status: PlayerStatus,
    position_ms: i64,
    duration_ms: i64,
    metadata: String,
    listeners: Vec<Arc<dyn StatusListener>>,
    remove_delay: Option<Duration>,
}

/// Scriptable in-memory receiver proxy.
pub struct FakePlayer {
    id: String,
    name: String,
    state: Mutex<FakeState>,
}

impl FakePlayer {
    pub fn new(id: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn device(id: &str, name: &str) -> Device {
        Self::new(id, name).as_device()
    }

    pub fn as_device(self: &Arc<Self>) -> Device {
        let player: Arc<dyn RemotePlayer> = Arc::clone(self) as Arc<dyn RemotePlayer>;
        Device::new(self.id.clone(), self.name.clone(), player)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn fail(&self, call: &str) {
        self.lock().failing.insert(call.to_string());
    }

    pub fn succeed(&self, call: &str) {
        self.lock().failing.remove(call);
    }

    pub fn set_status(&self, status: PlayerStatus) {
        self.lock().status = status;
    }

    pub fn set_duration(&self, duration_ms: i64) {
        self.lock().duration_ms = duration_ms;
    }

    pub fn set_position(&self, position_ms: i64) {
        self.lock().position_ms = position_ms;
    }

    pub fn set_metadata(&self, metadata: &str) {
        self.lock().metadata = metadata.to_string();
    }

    pub fn set_remove_delay(&self, delay: Duration) {
        self.lock().remove_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|recorded| recorded.as_str() == call || recorded.starts_with(&format!("{call}(")))
            .count()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Pushes a status change to every attached listener.
    pub fn push_status(&self, status: PlayerStatus, position_ms: i64) {
        let listeners = self.lock().listeners.clone();
        for listener in listeners {
            listener.on_status_change(status, position_ms);
        }
    }

    fn record(&self, call: String, name: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failing.contains(name) {
            return Err(FlingError::remote(name, "scripted failure"));
        }
        Ok(())
    }
}

impl RemotePlayer for FakePlayer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn unique_identifier(&self) -> String {
        self.id.clone()
    }

    fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> RemoteResult<()> {
        self.record("add_status_listener".to_string(), "add_status_listener")?;
        self.lock().listeners.push(listener);
        Ok(())
    }

    fn remove_status_listener(&self, listener: Arc<dyn StatusListener>) -> RemoteResult<()> {
        let delay = self.lock().remove_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.record("remove_status_listener".to_string(), "remove_status_listener")?;
        let id = listener.listener_id();
        self.lock()
            .listeners
            .retain(|attached| attached.listener_id() != id);
        Ok(())
    }

    fn set_media_source(
        &self,
        url: &str,
        metadata: &str,
        _flags: MediaSourceFlags,
    ) -> RemoteResult<()> {
        self.record(format!("set_media_source({url}|{metadata})"), "set_media_source")
    }

    fn play(&self) -> RemoteResult<()> {
        self.record("play".to_string(), "play")
    }

    fn pause(&self) -> RemoteResult<()> {
        self.record("pause".to_string(), "pause")
    }

    fn stop(&self) -> RemoteResult<()> {
        self.record("stop".to_string(), "stop")
    }

    fn seek(&self, mode: SeekMode, offset_ms: i64) -> RemoteResult<()> {
        self.record(format!("seek({mode:?},{offset_ms})"), "seek")
    }

    fn status(&self) -> RemoteResult<PlayerStatus> {
        self.record("status".to_string(), "status")?;
        Ok(self.lock().status)
    }

    fn position(&self) -> RemoteResult<i64> {
        self.record("position".to_string(), "position")?;
        Ok(self.lock().position_ms)
    }

    fn duration(&self) -> RemoteResult<i64> {
        self.record("duration".to_string(), "duration")?;
        Ok(self.lock().duration_ms)
    }

    fn media_info(&self) -> RemoteResult<MediaPlayerInfo> {
        self.record("media_info".to_string(), "media_info")?;
        Ok(MediaPlayerInfo {
            source: String::new(),
            metadata: self.lock().metadata.clone(),
        })
    }

    fn set_position_update_interval(&self, interval_ms: u64) -> RemoteResult<()> {
        self.record(
            format!("set_position_update_interval({interval_ms})"),
            "set_position_update_interval",
        )
    }
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let dir = std::env::temp_dir().join(format!("flingcast_{name}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
    dir
}
