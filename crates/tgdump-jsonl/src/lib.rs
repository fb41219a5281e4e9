//! JSON-lines sink adapter: one append-only `.jsonl` file per dialog.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde_json::Value;

use tgdump_core::{
    dialog::Dialog,
    errors::Error,
    msg_id::MsgId,
    progress::DumpProgress,
    sink::Dumper,
    utils::safe_name,
    Result,
};

pub const OUTPUT_TYPE: &str = "json_lines";

pub struct JsonLinesDumper {
    backup_dir: PathBuf,
    current: Option<BufWriter<File>>,
}

impl JsonLinesDumper {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            current: None,
        }
    }

    pub fn dialog_file(&self, dialog: &Dialog) -> PathBuf {
        self.backup_dir
            .join(format!("{}.jsonl", safe_name(&dialog.display_name)))
    }
}

impl Dumper for JsonLinesDumper {
    fn output_type(&self) -> &'static str {
        OUTPUT_TYPE
    }

    fn start_backup(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_dialog(&mut self, dialog: &Dialog, _prior: &DumpProgress) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dialog_file(dialog))?;
        self.current = Some(BufWriter::new(file));
        Ok(())
    }

    fn msg_fresh(&self, msg: &Value, prior: &DumpProgress) -> bool {
        let Some(last_id) = prior.last_id else {
            return true;
        };
        msg.get("id")
            .and_then(MsgId::from_value)
            .map_or(true, |id| id > last_id)
    }

    fn dump_chunk(&mut self, _dialog: &Dialog, messages: &[Value]) -> Result<()> {
        let out = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Fatal("dump_chunk outside of a dialog".to_string()))?;
        for msg in messages {
            let line = serde_json::to_string(msg)?;
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    fn end_dialog(&mut self, _dialog: &Dialog) -> Result<Option<Value>> {
        if let Some(mut out) = self.current.take() {
            out.flush()?;
        }
        Ok(None)
    }

    fn end_backup(&mut self) -> Result<()> {
        Ok(())
    }
}
