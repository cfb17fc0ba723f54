//! Persistence of the last connected receiver id.
//!
//! The id lives in `state.toml` under `[session] last_player_id`. Edits go through
//! `toml_edit` so comments and unrelated keys in the file survive.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{value, DocumentMut, Item, Table};

use crate::error::{FlingError, Result};

const SESSION_SECTION: &str = "session";
const LAST_PLAYER_KEY: &str = "last_player_id";

/// Writes `contents` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    if temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    if let Err(err) = fs::write(&temp_path, contents) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    Ok(())
}

fn ensure_section_table(document: &mut DocumentMut, key: &str) {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
}

#[derive(Debug, Clone)]
pub struct LastPlayerStore {
    path: PathBuf,
}

impl LastPlayerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<DocumentMut> {
        if !self.path.exists() {
            return Ok(DocumentMut::new());
        }
        let text = fs::read_to_string(&self.path)?;
        text.parse::<DocumentMut>().map_err(|err| {
            FlingError::Persistence(format!(
                "failed to parse {} as TOML document: {}",
                self.path.display(),
                err
            ))
        })
    }

    /// Returns the stored id; a missing or unreadable file reads as none.
    pub fn load(&self) -> Option<String> {
        let document = match self.read_document() {
            Ok(document) => document,
            Err(err) => {
                warn!("LastPlayerStore: ignoring unreadable state: {}", err);
                return None;
            }
        };
        let id = document
            .get(SESSION_SECTION)
            .and_then(|section| section.get(LAST_PLAYER_KEY))
            .and_then(|item| item.as_str())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        info!("LastPlayerStore: last player id={:?}", id);
        id
    }

    pub fn store(&self, player_id: &str) -> Result<()> {
        let mut document = self.read_document().unwrap_or_else(|err| {
            warn!("LastPlayerStore: rewriting unreadable state: {}", err);
            DocumentMut::new()
        });
        ensure_section_table(&mut document, SESSION_SECTION);
        document[SESSION_SECTION][LAST_PLAYER_KEY] = value(player_id);
        write_atomic(&self.path, &document.to_string())?;
        info!("LastPlayerStore: stored id {}", player_id);
        Ok(())
    }

    /// Removes the stored id, keeping the rest of the file.
    pub fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut document = self.read_document().unwrap_or_else(|err| {
            warn!("LastPlayerStore: rewriting unreadable state: {}", err);
            DocumentMut::new()
        });
        if let Some(section) = document
            .get_mut(SESSION_SECTION)
            .and_then(Item::as_table_mut)
        {
            section.remove(LAST_PLAYER_KEY);
        }
        write_atomic(&self.path, &document.to_string())?;
        info!("LastPlayerStore: cleared last player id");
        Ok(())
    }
}
