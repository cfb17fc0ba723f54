//! Discovery-driven receiver registry, session rejoin and remote transport control
//! for flinging media to networked players.
//!
//! Components talk over a `tokio::sync::broadcast` bus of [`protocol::Message`]s.
//! [`app_runtime::FlingRuntime`] wires them together for a host application.

pub mod app_runtime;
pub mod catalog;
pub mod config;
pub mod device_registry;
pub mod discovery;
pub mod error;
pub mod presentation;
pub mod protocol;
pub mod remote;
pub mod remote_call;
pub mod session;
pub mod session_manager;
pub mod state_persistence;
pub mod status;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use app_runtime::{FlingRuntime, RuntimePaths};
pub use catalog::{MediaCatalog, MediaItem};
pub use config::Config;
pub use device_registry::{Device, DeviceRegistry, DeviceSummary};
pub use discovery::{MdnsDiscovery, PlayerConnector, ReceiverEndpoint};
pub use error::{FlingError, Result};
pub use presentation::PresentationModel;
pub use protocol::Message;
pub use remote::{DiscoveryListener, DiscoveryService, RemotePlayer, StatusListener};
pub use session::SessionState;
