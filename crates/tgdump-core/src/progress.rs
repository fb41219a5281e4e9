use std::{collections::BTreeMap, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::Config, errors::Error, msg_id::MsgId, utils::iso_timestamp_utc, Result};

pub const PROGRESS_FILE: &str = "progress.json";

/// Per-dialog resumption state.
///
/// `dumper_state` is an opaque blob owned by the sink; the engine stores it
/// verbatim and never inspects it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DumpProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<MsgId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub dumper_state: Value,
}

impl DumpProgress {
    /// Fold one archived message into the record. Boundaries only ever move
    /// forward.
    pub fn update(&mut self, msg: &Value) {
        if let Some(id) = msg.get("id").and_then(MsgId::from_value) {
            if self.last_id.map_or(true, |last| id > last) {
                self.last_id = Some(id);
            }
        }
        if let Some(date) = msg.get("date").and_then(Value::as_i64) {
            if self.last_date.map_or(true, |last| date > last) {
                self.last_date = Some(date);
            }
        }
    }
}

/// On-disk progress document.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dumper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(default)]
    dialogs: BTreeMap<String, DumpProgress>,
}

/// Resumption state for the whole run.
///
/// Loaded once at startup. The snapshot taken at load time drives freshness
/// decisions for the entire run, while the live map accumulates updates and
/// is persisted after each completed dialog, so a crash loses at most one
/// dialog's progress.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    enabled: bool,
    live: BTreeMap<String, DumpProgress>,
    snapshot: BTreeMap<String, DumpProgress>,
}

impl ProgressStore {
    /// Load prior progress, verifying that whoever produced the file is the
    /// sink in use now. A mismatch is a configuration error, never an
    /// overwrite, and must surface before any connection attempt.
    pub fn load(cfg: &Config, output_type: &str) -> Result<Self> {
        let path = cfg.backup_dir.join(PROGRESS_FILE);
        if !cfg.track_progress {
            return Ok(Self {
                path,
                enabled: false,
                live: BTreeMap::new(),
                snapshot: BTreeMap::new(),
            });
        }
        let live = match fs::read_to_string(&path) {
            Ok(contents) => {
                let file: ProgressFile = serde_json::from_str(&contents)?;
                if let Some(dumper) = &file.dumper {
                    if dumper != output_type {
                        return Err(Error::Config(format!(
                            "dumper conflict: using \"{output_type}\" but progress file reads \"{dumper}\""
                        )));
                    }
                }
                file.dialogs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let snapshot = live.clone();
        Ok(Self {
            path,
            enabled: true,
            live,
            snapshot,
        })
    }

    /// Prior-run state for one dialog, as of startup. Live updates made
    /// during this run never show up here.
    pub fn snapshot_for(&self, dialog_id: &str) -> DumpProgress {
        self.snapshot.get(dialog_id).cloned().unwrap_or_default()
    }

    pub fn update(&mut self, dialog_id: &str, msg: &Value) {
        self.live.entry(dialog_id.to_string()).or_default().update(msg);
    }

    pub fn set_dumper_state(&mut self, dialog_id: &str, state: Value) {
        self.live.entry(dialog_id.to_string()).or_default().dumper_state = state;
    }

    /// Persist the live map. Called synchronously after each completed
    /// dialog, not only at exit.
    pub fn save(&self, output_type: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let file = ProgressFile {
            dumper: Some(output_type.to_string()),
            last_modified: Some(iso_timestamp_utc()),
            dialogs: self.live.clone(),
        };
        let mut json = serde_json::to_string_pretty(&file)?;
        json.push('\n');
        fs::write(&self.path, json)?;
        Ok(())
    }
}
