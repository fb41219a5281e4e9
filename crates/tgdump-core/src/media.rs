use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::{
    backend::{BackendClient, CommandError, CommandResult},
    config::Config,
    dialog::Dialog,
    utils::{safe_name, scalar_to_string},
};

const MEDIA_TYPES: [&str; 4] = ["document", "video", "photo", "audio"];

/// Attachment retrieval/placement policy.
///
/// Shares the engine's timeout posture but not its retry loop: one attempt
/// per attachment, and every failure short of a fatal one downgrades to a
/// log line with the attachment link omitted. The message itself is always
/// archived.
pub struct MediaHandler<'a> {
    cfg: &'a Config,
}

impl<'a> MediaHandler<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self { cfg }
    }

    pub fn media_dir(&self, dialog: &Dialog) -> PathBuf {
        self.cfg
            .backup_dir
            .join("media")
            .join(safe_name(&dialog.display_name))
    }

    pub async fn process(
        &self,
        client: &mut dyn BackendClient,
        dialog: &Dialog,
        msg: &mut Value,
    ) -> CommandResult<()> {
        let Some(media_type) = msg
            .get("media")
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };
        if !MEDIA_TYPES.contains(&media_type.as_str())
            || !self.cfg.download_media.enabled(&media_type)
        {
            return Ok(());
        }
        let Some(msg_id) = msg.get("id").and_then(scalar_to_string) else {
            return Ok(());
        };

        let command = format!("load_{media_type}");
        let response = match timeout(
            self.cfg.media_timeout(),
            client.execute(&command, &[msg_id.clone()]),
        )
        .await
        {
            Ok(Ok(response)) => Some(response),
            Ok(Err(CommandError::Fatal(e))) => return Err(CommandError::Fatal(e)),
            Ok(Err(e)) => {
                warn!("Failed to download media file: {e}");
                None
            }
            Err(_) => {
                warn!("Failed to download media file: timed out");
                None
            }
        };

        let source = response
            .as_ref()
            .and_then(|r| r.get("result"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let filename = match &source {
            None => {
                error!("Wrong response on media download for message id {msg_id}");
                None
            }
            Some(src) if self.cfg.copy_media => self.copy_into_media_dir(dialog, Path::new(src)),
            Some(src) => Some(src.clone()),
        };

        if self.cfg.delete_media {
            if let Some(src) = &source {
                if let Err(e) = fs::remove_file(src) {
                    error!("Failed to delete media file: {e}");
                }
            }
        }

        if let Some(file) = filename {
            msg["media"]["file"] = Value::String(file);
        }
        Ok(())
    }

    fn copy_into_media_dir(&self, dialog: &Dialog, source: &Path) -> Option<String> {
        let Some(basename) = source.file_name().and_then(|n| n.to_str()) else {
            warn!("Media path has no usable file name: {}", source.display());
            return None;
        };
        let destination = self.media_dir(dialog).join(fix_media_ext(basename));
        if let Err(e) = fs::copy(source, &destination) {
            warn!("Failed to copy media file to {}: {e}", destination.display());
            return None;
        }
        Some(destination.to_string_lossy().into_owned())
    }
}

/// telegram-cli saves media with a few nonstandard extensions; replace the
/// known cases with their canonical ones.
fn fix_media_ext(filename: &str) -> String {
    if let Some(stem) = filename.strip_suffix(".mpga") {
        return format!("{stem}.mp3");
    }
    if let Some(stem) = filename.strip_suffix(".oga") {
        return format!("{stem}.ogg");
    }
    filename.to_string()
}
