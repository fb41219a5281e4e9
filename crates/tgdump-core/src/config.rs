use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{errors::Error, Result};

/// Typed configuration for the dumper.
///
/// Loaded from a TOML file; every option has a default, so an empty file is
/// a valid configuration. The binary resolves the path via `TGDUMP_CONFIG`
/// or falls back to `tgdump.toml` in the working directory.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // Connection target: a unix control socket path wins over host:port.
    pub tg_sock: Option<PathBuf>,
    pub tg_host: String,
    pub tg_port: u16,

    pub backup_dir: PathBuf,
    /// Upper bound passed to the backend's listing commands.
    pub maximum_dialogs: u64,

    // Pagination
    pub chunk_size: u64,
    pub chunk_retry: u32,
    pub chunk_timeout_secs: f64,
    pub chunk_delay_secs: f64,
    pub conn_timeout_secs: f64,
    /// 0 disables the backlog cap.
    pub backlog_limit: u64,

    // Freshness / filtering
    pub track_progress: bool,
    /// Messages whose text matches are dropped without ending pagination.
    pub filter_regex: Option<String>,

    // Media
    pub download_media: DownloadMedia,
    pub media_timeout_secs: f64,
    pub copy_media: bool,
    pub delete_media: bool,

    // Backend lifecycle
    /// Send `quit` to the backend once the run is over.
    pub kill_backend: bool,

    // Per-kind allow-lists: absent = skip the kind, empty = all of the kind.
    pub backup_users: Option<Vec<AllowEntry>>,
    pub backup_groups: Option<Vec<AllowEntry>>,
    pub backup_channels: Option<Vec<AllowEntry>>,
    pub backup_supergroups: Option<Vec<AllowEntry>>,
}

/// Which attachment types get downloaded alongside their messages.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DownloadMedia {
    pub photo: bool,
    pub video: bool,
    pub document: bool,
    pub audio: bool,
}

impl DownloadMedia {
    pub fn any(&self) -> bool {
        self.photo || self.video || self.document || self.audio
    }

    pub fn enabled(&self, media_type: &str) -> bool {
        match media_type {
            "photo" => self.photo,
            "video" => self.video,
            "document" => self.document,
            "audio" => self.audio,
            _ => false,
        }
    }
}

/// Allow-list entry: a numeric dialog id, or a string that matches an id
/// verbatim or a display-name substring.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AllowEntry {
    Id(i64),
    Name(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tg_sock: None,
            tg_host: "localhost".to_string(),
            tg_port: 2391,
            backup_dir: PathBuf::from("output"),
            maximum_dialogs: 800,
            chunk_size: 100,
            chunk_retry: 10,
            chunk_timeout_secs: 60.0,
            chunk_delay_secs: 2.0,
            conn_timeout_secs: 30.0,
            backlog_limit: 0,
            track_progress: true,
            filter_regex: None,
            download_media: DownloadMedia::default(),
            media_timeout_secs: 120.0,
            copy_media: true,
            delete_media: false,
            kill_backend: false,
            backup_users: None,
            backup_groups: None,
            backup_channels: None,
            backup_supergroups: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Config path resolution used by the binary.
    pub fn default_path() -> PathBuf {
        env::var_os("TGDUMP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tgdump.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
        }
        for (name, secs) in [
            ("chunk_timeout_secs", self.chunk_timeout_secs),
            ("chunk_delay_secs", self.chunk_delay_secs),
            ("conn_timeout_secs", self.conn_timeout_secs),
            ("media_timeout_secs", self.media_timeout_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::Config(format!("{name} must be a non-negative number")));
            }
        }
        if let Some(pattern) = &self.filter_regex {
            regex::Regex::new(pattern)
                .map_err(|e| Error::Config(format!("bad filter_regex: {e}")))?;
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_timeout_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_delay_secs)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.conn_timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.media_timeout_secs)
    }
}
