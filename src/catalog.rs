//! JSON media catalog stored in a writable location.
//!
//! The first load seeds the file from the bundled default. Entries that fail to
//! parse are skipped one by one; an unreadable document yields an empty catalog.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::error::{FlingError, Result};
use crate::state_persistence::write_atomic;

pub const BUNDLED_CATALOG: &str = include_str!("../assets/FlingSample.json");

/// One castable entry of the catalog.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MediaItem {
    pub title: String,
    pub url: String,
    #[serde(rename = "iconUrl", default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MediaItem {
    /// Metadata serialized as the JSON document sent along with the media source.
    pub fn metadata_json(&self) -> String {
        serde_json::Value::Object(self.metadata.clone()).to_string()
    }
}

/// Parses a catalog document, skipping entries that do not describe a media item.
pub fn parse_catalog(text: &str) -> Result<Vec<MediaItem>> {
    let document: serde_json::Value = serde_json::from_str(text)?;
    let serde_json::Value::Array(entries) = document else {
        return Err(FlingError::Parse(
            "catalog document is not a JSON array".to_string(),
        ));
    };

    let mut items = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<MediaItem>(entry) {
            Ok(item) => items.push(item),
            Err(err) => warn!("MediaCatalog: skipping entry {}: {}", index, err),
        }
    }
    Ok(items)
}

#[derive(Debug, Clone)]
pub struct MediaCatalog {
    path: PathBuf,
    default_contents: String,
}

impl MediaCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self::with_default(path, BUNDLED_CATALOG.to_string())
    }

    pub fn with_default(path: PathBuf, default_contents: String) -> Self {
        Self {
            path,
            default_contents,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeds the catalog file from the default unless it exists. The copy lands
    /// through a temp file and a rename, so a partial copy is never visible.
    pub fn ensure_writable_copy(&self) -> Result<()> {
        if self.path.exists() {
            debug!("MediaCatalog: using existing {}", self.path.display());
            return Ok(());
        }
        info!(
            "MediaCatalog: seeding {} from bundled default",
            self.path.display()
        );
        write_atomic(&self.path, &self.default_contents)
    }

    /// Loads all items. Failures are logged and yield an empty list.
    pub fn load(&self) -> Vec<MediaItem> {
        if let Err(err) = self.ensure_writable_copy() {
            error!("MediaCatalog: catalog is not available: {}", err);
            return Vec::new();
        }
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) => {
                error!(
                    "MediaCatalog: failed to read {}: {}",
                    self.path.display(),
                    err
                );
                return Vec::new();
            }
        };
        match parse_catalog(&text) {
            Ok(items) => {
                info!("MediaCatalog: loaded {} items", items.len());
                items
            }
            Err(err) => {
                error!("MediaCatalog: error reading catalog: {}", err);
                Vec::new()
            }
        }
    }
}
