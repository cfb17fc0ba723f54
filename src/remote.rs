//! Contract consumed from the receiver discovery and control SDK.
//!
//! Every `RemotePlayer` call is blocking. Callers run them on background units
//! (see `remote_call`) and never on the owning context.

use std::sync::Arc;

use uuid::Uuid;

use crate::device_registry::Device;
use crate::error::FlingError;

pub type RemoteResult<T> = Result<T, FlingError>;

/// Playback state reported by a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub enum MediaState {
    #[default]
    NoSource,
    PreparingMedia,
    ReadyToPlay,
    Playing,
    Paused,
    Finished,
    Seeking,
    Error,
}

/// Health of the media pipeline on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub enum MediaCondition {
    #[default]
    Good,
    WarningContent,
    WarningBandwidth,
    ErrorContent,
    ErrorChannel,
    ErrorUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerStatus {
    pub state: MediaState,
    pub condition: MediaCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Absolute,
    Relative,
}

/// Options passed along with a new media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSourceFlags {
    pub auto_play: bool,
    pub play_in_background: bool,
}

/// Media info attached to the current source. `metadata` is a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaPlayerInfo {
    pub source: String,
    pub metadata: String,
}

/// Receives status pushes from a receiver once attached.
pub trait StatusListener: Send + Sync {
    /// Stable identity used by proxies to match add/remove calls.
    fn listener_id(&self) -> Uuid;

    fn on_status_change(&self, status: PlayerStatus, position_ms: i64);
}

/// Proxy for one remote media receiver.
pub trait RemotePlayer: Send + Sync {
    fn name(&self) -> String;
    fn unique_identifier(&self) -> String;

    fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> RemoteResult<()>;
    fn remove_status_listener(&self, listener: Arc<dyn StatusListener>) -> RemoteResult<()>;

    fn set_media_source(
        &self,
        url: &str,
        metadata: &str,
        flags: MediaSourceFlags,
    ) -> RemoteResult<()>;
    fn play(&self) -> RemoteResult<()>;
    fn pause(&self) -> RemoteResult<()>;
    fn stop(&self) -> RemoteResult<()>;
    fn seek(&self, mode: SeekMode, offset_ms: i64) -> RemoteResult<()>;

    fn status(&self) -> RemoteResult<PlayerStatus>;
    fn position(&self) -> RemoteResult<i64>;
    fn duration(&self) -> RemoteResult<i64>;
    fn media_info(&self) -> RemoteResult<MediaPlayerInfo>;
    fn set_position_update_interval(&self, interval_ms: u64) -> RemoteResult<()>;
}

/// Callbacks invoked by a discovery service, from any thread.
pub trait DiscoveryListener: Send + Sync {
    fn device_found(&self, device: Device);
    fn device_lost(&self, device: Device);
    fn discovery_failure(&self, reason: String);
}

/// Source of found/lost events for one service type.
pub trait DiscoveryService: Send {
    fn start(
        &mut self,
        service_type: &str,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<(), FlingError>;

    fn stop(&mut self);
}
