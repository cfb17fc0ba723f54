//! Runtime wiring: paths, configuration, catalog, the session manager thread and
//! the discovery lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};

use crate::catalog::{MediaCatalog, MediaItem};
use crate::config::{load_or_create_config, Config};
use crate::device_registry::{DeviceRegistry, DeviceSummary};
use crate::discovery::BusDiscoveryListener;
use crate::error::{FlingError, Result};
use crate::protocol::{DiscoveryMessage, Message, SessionMessage};
use crate::remote::DiscoveryService;
use crate::remote_call::{TaskSpawner, ThreadSpawner};
use crate::session_manager::SessionManager;
use crate::state_persistence::LastPlayerStore;
use crate::status::{Status, StatusStore};

const BUS_CAPACITY: usize = 8192;
const PAUSE_ACK_GRACE: Duration = Duration::from_millis(1_000);
const PAUSE_ACK_POLL: Duration = Duration::from_millis(10);

/// Files and directories owned by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    /// Default catalog directory, unless the config overrides it.
    pub catalog_dir: PathBuf,
}

impl RuntimePaths {
    /// `<config_dir>/flingcast/{config,state}.toml` and `<data_dir>/flingcast`.
    pub fn default_paths() -> Result<Self> {
        let config_root = dirs::config_dir()
            .ok_or_else(|| FlingError::Persistence("no user config directory".to_string()))?
            .join("flingcast");
        let data_root = dirs::data_dir()
            .ok_or_else(|| FlingError::Persistence("no user data directory".to_string()))?
            .join("flingcast");
        Ok(Self {
            config_file: config_root.join("config.toml"),
            state_file: config_root.join("state.toml"),
            catalog_dir: data_root,
        })
    }

    pub fn under(root: &Path) -> Self {
        Self {
            config_file: root.join("config.toml"),
            state_file: root.join("state.toml"),
            catalog_dir: root.join("data"),
        }
    }
}

/// A running fling session host.
pub struct FlingRuntime<D: DiscoveryService> {
    config: Config,
    bus_sender: Sender<Message>,
    registry: Arc<DeviceRegistry>,
    status: Arc<StatusStore>,
    catalog: Vec<MediaItem>,
    discovery: D,
    manager_thread: Option<JoinHandle<()>>,
    discovering: bool,
}

impl<D: DiscoveryService> FlingRuntime<D> {
    pub fn build(paths: &RuntimePaths, discovery: D) -> Result<Self> {
        Self::build_with_spawner(paths, discovery, Arc::new(ThreadSpawner))
    }

    pub fn build_with_spawner(
        paths: &RuntimePaths,
        discovery: D,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Result<Self> {
        let config = load_or_create_config(&paths.config_file)?;
        let catalog_dir = config
            .catalog
            .directory
            .clone()
            .unwrap_or_else(|| paths.catalog_dir.clone());
        let catalog = MediaCatalog::new(catalog_dir.join(&config.catalog.file_name)).load();

        let (bus_sender, _) = broadcast::channel(BUS_CAPACITY);
        let registry = Arc::new(DeviceRegistry::new());
        let status = Arc::new(StatusStore::new());
        let mut manager = SessionManager::new(
            bus_sender.subscribe(),
            bus_sender.clone(),
            Arc::clone(&registry),
            Arc::clone(&status),
            LastPlayerStore::new(paths.state_file.clone()),
            spawner,
            &config,
        );
        let manager_thread = thread::Builder::new()
            .name("session-manager".to_string())
            .spawn(move || manager.run())?;
        info!(
            "FlingRuntime: started with {} catalog items, config={}",
            catalog.len(),
            paths.config_file.display()
        );

        Ok(Self {
            config,
            bus_sender,
            registry,
            status,
            catalog,
            discovery,
            manager_thread: Some(manager_thread),
            discovering: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &[MediaItem] {
        &self.catalog
    }

    pub fn sender(&self) -> Sender<Message> {
        self.bus_sender.clone()
    }

    pub fn subscribe(&self) -> Receiver<Message> {
        self.bus_sender.subscribe()
    }

    pub fn send(&self, message: Message) {
        if self.bus_sender.send(message).is_err() {
            warn!("FlingRuntime: bus has no receivers");
        }
    }

    pub fn sorted_devices(&self) -> Vec<DeviceSummary> {
        self.registry.sorted_summaries()
    }

    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    /// Host came to the foreground: re-read the last player and start discovery.
    pub fn resume(&mut self) -> Result<()> {
        self.send(Message::Session(SessionMessage::Resume));
        if self.discovering {
            return Ok(());
        }
        let listener = Arc::new(BusDiscoveryListener::new(self.bus_sender.clone()));
        match self
            .discovery
            .start(&self.config.discovery.service_type, listener)
        {
            Ok(()) => {
                self.discovering = true;
                Ok(())
            }
            Err(err) => {
                self.send(Message::Discovery(DiscoveryMessage::DiscoveryFailure(
                    err.to_string(),
                )));
                Err(err)
            }
        }
    }

    /// Host is leaving the foreground. Stops discovery, then waits for the session
    /// manager to persist, detach and clean. Returns false if no ack arrived in time.
    pub fn pause(&mut self) -> bool {
        let mut ack_receiver = self.bus_sender.subscribe();
        if self.discovering {
            self.discovery.stop();
            self.discovering = false;
        }
        self.send(Message::Session(SessionMessage::AppPausing));

        let deadline =
            Instant::now() + Duration::from_millis(self.config.session.detach_timeout_ms) + PAUSE_ACK_GRACE;
        loop {
            match ack_receiver.try_recv() {
                Ok(Message::Session(SessionMessage::Paused)) => return true,
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        warn!("FlingRuntime: pause was not acknowledged in time");
                        return false;
                    }
                    thread::sleep(PAUSE_ACK_POLL);
                }
                Err(TryRecvError::Closed) => return false,
            }
        }
    }

    /// Stops discovery and joins the session manager thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.manager_thread.take() else {
            return;
        };
        if self.discovering {
            self.discovery.stop();
            self.discovering = false;
        }
        self.send(Message::Session(SessionMessage::Shutdown));
        if handle.join().is_err() {
            warn!("FlingRuntime: session manager thread panicked");
        }
        info!("FlingRuntime: shut down");
    }
}

impl<D: DiscoveryService> Drop for FlingRuntime<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
