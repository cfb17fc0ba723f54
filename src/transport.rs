//! Transport commands, status queries and the failure tolerance window.
//!
//! `TransportFacade` holds the per-session policy state: the consecutive error
//! counter, the cached duration and title, and which queries are in flight. The
//! remote calls themselves run on background units owned by the session manager.

use std::collections::HashSet;

use log::{debug, warn};

use crate::catalog::MediaItem;
use crate::config::TransportConfig;
use crate::error::FlingError;
use crate::remote::{MediaSourceFlags, MediaState, RemotePlayer, RemoteResult, SeekMode};

const FLING_FLAGS: MediaSourceFlags = MediaSourceFlags {
    auto_play: true,
    play_in_background: false,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    SetPositionUpdateInterval(u64),
    SetMediaSource { url: String, metadata: String },
    Play,
    Pause,
    Stop,
    Seek { mode: SeekMode, offset_ms: i64 },
}

impl TransportCommand {
    /// Shown as a toast when the command succeeds.
    pub fn label(&self) -> &'static str {
        match self {
            TransportCommand::SetPositionUpdateInterval(_) => "set_position_update_interval",
            TransportCommand::SetMediaSource { .. } => "set_media_source",
            TransportCommand::Play => "play",
            TransportCommand::Pause => "pause",
            TransportCommand::Stop => "stop",
            TransportCommand::Seek { .. } => "seek",
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            TransportCommand::SetPositionUpdateInterval(_) => {
                "Error attempting set update interval, ignoring"
            }
            TransportCommand::SetMediaSource { .. } => "Error attempting to Play:",
            TransportCommand::Play => "Error Playing",
            TransportCommand::Pause => "Error Pausing",
            TransportCommand::Stop => "Error Stopping",
            TransportCommand::Seek { .. } => "Error Seeking",
        }
    }

    /// Fling-time commands append the remote cause to the escalation message.
    pub fn extends_with_cause(&self) -> bool {
        matches!(
            self,
            TransportCommand::SetPositionUpdateInterval(_) | TransportCommand::SetMediaSource { .. }
        )
    }

    pub fn escalation_message(&self, err: &FlingError) -> String {
        if self.extends_with_cause() {
            format!("{} {}", self.failure_message(), err.cause())
        } else {
            self.failure_message().to_string()
        }
    }

    pub fn execute(&self, player: &dyn RemotePlayer) -> RemoteResult<()> {
        match self {
            TransportCommand::SetPositionUpdateInterval(interval_ms) => {
                player.set_position_update_interval(*interval_ms)
            }
            TransportCommand::SetMediaSource { url, metadata } => {
                player.set_media_source(url, metadata, FLING_FLAGS)
            }
            TransportCommand::Play => player.play(),
            TransportCommand::Pause => player.pause(),
            TransportCommand::Stop => player.stop(),
            TransportCommand::Seek { mode, offset_ms } => player.seek(*mode, *offset_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportQuery {
    Position,
    Duration,
    MediaTitle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Position(i64),
    Duration(i64),
    /// `None` when the metadata blob carried no readable title.
    MediaTitle(Option<String>),
}

impl TransportQuery {
    pub fn label(&self) -> &'static str {
        match self {
            TransportQuery::Position => "position",
            TransportQuery::Duration => "duration",
            TransportQuery::MediaTitle => "media_title",
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            TransportQuery::Position => "Error retrieving position",
            TransportQuery::Duration => "Error retrieving duration",
            TransportQuery::MediaTitle => "Error retrieving media info",
        }
    }

    pub fn execute(&self, player: &dyn RemotePlayer) -> RemoteResult<QueryValue> {
        match self {
            TransportQuery::Position => player.position().map(QueryValue::Position),
            TransportQuery::Duration => player.duration().map(QueryValue::Duration),
            TransportQuery::MediaTitle => {
                let info = player.media_info()?;
                match extract_media_title(&info.metadata) {
                    Ok(title) => Ok(QueryValue::MediaTitle(Some(title))),
                    Err(err) => {
                        warn!("TransportQuery: cannot parse metadata: {}", err);
                        Ok(QueryValue::MediaTitle(None))
                    }
                }
            }
        }
    }
}

/// Reads the `title` string out of a media metadata JSON document.
pub fn extract_media_title(metadata: &str) -> Result<String, FlingError> {
    let value: serde_json::Value = serde_json::from_str(metadata)?;
    value
        .get("title")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FlingError::Parse("metadata has no string 'title'".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Still inside the tolerance window; log only.
    Absorbed { count: u32 },
    /// Window exceeded; show the dialog and force-disconnect.
    Escalate { message: String },
}

/// What a status change asks the session manager to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backfill {
    pub reset_duration: bool,
    pub queries: Vec<TransportQuery>,
}

#[derive(Debug)]
pub struct TransportFacade {
    max_errors: u32,
    error_count: u32,
    seek_step_ms: i64,
    position_update_interval_ms: u64,
    duration_ms: i64,
    duration_set: bool,
    title: Option<String>,
    /// Bumped whenever the cached media is reset; query results carry the value
    /// they were issued under.
    media_generation: u64,
    in_flight: HashSet<TransportQuery>,
}

impl TransportFacade {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            max_errors: config.max_consecutive_errors,
            error_count: 0,
            seek_step_ms: config.seek_step_ms as i64,
            position_update_interval_ms: config.position_update_interval_ms,
            duration_ms: 0,
            duration_set: false,
            title: None,
            media_generation: 0,
            in_flight: HashSet::new(),
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
    }

    pub fn record_success(&mut self) {
        self.error_count = 0;
    }

    /// Counts one failure. The counter resets once it escalates.
    pub fn record_failure(&mut self, message: String) -> FailureVerdict {
        self.error_count += 1;
        if self.error_count > self.max_errors {
            self.error_count = 0;
            FailureVerdict::Escalate { message }
        } else {
            FailureVerdict::Absorbed {
                count: self.error_count,
            }
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn duration_known(&self) -> bool {
        self.duration_set
    }

    pub fn apply_duration(&mut self, duration_ms: i64) {
        self.duration_ms = duration_ms;
        self.duration_set = true;
    }

    /// Forgets the duration and starts a new media generation. Queries still in
    /// flight belong to the old media and no longer block new ones.
    pub fn reset_duration(&mut self) {
        self.duration_ms = 0;
        self.duration_set = false;
        self.media_generation += 1;
        self.in_flight.clear();
    }

    pub fn media_generation(&self) -> u64 {
        self.media_generation
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn apply_title(&mut self, title: String) {
        self.title = Some(title);
    }

    pub fn reset_title(&mut self) {
        self.title = None;
    }

    /// Forgets cached media state and in-flight queries of the previous session.
    pub fn reset_session(&mut self) {
        self.reset_duration();
        self.reset_title();
    }

    /// Clamps a seek target to `[0, duration]`, or to `>= 0` when no duration is known.
    pub fn clamp_absolute_seek(&self, position_ms: i64) -> i64 {
        let lower_bounded = position_ms.max(0);
        if self.duration_set && self.duration_ms > 0 {
            lower_bounded.min(self.duration_ms)
        } else {
            lower_bounded
        }
    }

    pub fn seek_to(&self, position_ms: i64) -> TransportCommand {
        TransportCommand::Seek {
            mode: SeekMode::Absolute,
            offset_ms: self.clamp_absolute_seek(position_ms),
        }
    }

    pub fn forward(&self) -> TransportCommand {
        TransportCommand::Seek {
            mode: SeekMode::Relative,
            offset_ms: self.seek_step_ms,
        }
    }

    pub fn backward(&self) -> TransportCommand {
        TransportCommand::Seek {
            mode: SeekMode::Relative,
            offset_ms: -self.seek_step_ms,
        }
    }

    /// Commands issued, in order, when flinging `item`.
    pub fn fling_commands(&self, item: &MediaItem) -> Vec<TransportCommand> {
        vec![
            TransportCommand::SetPositionUpdateInterval(self.position_update_interval_ms),
            TransportCommand::SetMediaSource {
                url: item.url.clone(),
                metadata: item.metadata_json(),
            },
        ]
    }

    /// Marks `query` in flight. Returns false if one is already running.
    pub fn begin_query(&mut self, query: TransportQuery) -> bool {
        self.in_flight.insert(query)
    }

    /// Clears the in-flight mark. Returns false for a result issued under an older
    /// media generation, which must be discarded.
    pub fn finish_query(&mut self, query: TransportQuery, generation: u64) -> bool {
        if generation != self.media_generation {
            return false;
        }
        self.in_flight.remove(&query);
        true
    }

    /// Decides which queries a status change triggers and marks them in flight.
    pub fn backfill(&mut self, state: MediaState) -> Backfill {
        let mut backfill = Backfill::default();
        let mut wanted = Vec::new();
        match state {
            MediaState::ReadyToPlay => {
                self.reset_duration();
                backfill.reset_duration = true;
                wanted.push(TransportQuery::Duration);
                wanted.push(TransportQuery::MediaTitle);
            }
            MediaState::Playing => {
                if !self.duration_set {
                    wanted.push(TransportQuery::Duration);
                }
                if self.title.is_none() {
                    wanted.push(TransportQuery::MediaTitle);
                }
            }
            MediaState::Paused => {
                if !self.duration_set {
                    wanted.push(TransportQuery::Duration);
                    wanted.push(TransportQuery::Position);
                }
                if self.title.is_none() {
                    wanted.push(TransportQuery::MediaTitle);
                }
            }
            MediaState::Finished => {
                self.reset_duration();
                backfill.reset_duration = true;
            }
            _ => {}
        }
        for query in wanted {
            if self.begin_query(query) {
                backfill.queries.push(query);
            } else {
                debug!("TransportFacade: {:?} query already in flight", query);
            }
        }
        backfill
    }
}
