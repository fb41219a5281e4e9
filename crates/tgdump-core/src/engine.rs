use std::fs;

use regex::Regex;
use serde_json::Value;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::{
    backend::{BackendClient, CommandError, CommandResult},
    config::Config,
    dialog::Dialog,
    errors::Error,
    media::MediaHandler,
    msg_id::MsgId,
    progress::ProgressStore,
    sink::Dumper,
    Result,
};

/// Why pagination stopped for a dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The backend ran out of history.
    Exhausted,
    /// Hit a message already archived in a previous run.
    Stale,
    /// Hit the configured backlog cap.
    LimitReached,
}

/// Outcome of one dialog's dump.
#[derive(Clone, Copy, Debug)]
pub struct DialogOutcome {
    pub stop: StopReason,
    /// Messages handed to the sink.
    pub fresh: usize,
    /// Malformed messages dropped (missing id or date).
    pub dropped: usize,
    /// Identifier-ordering warnings emitted.
    pub anomalies: usize,
    /// At least one chunk was abandoned after exhausting its retries.
    pub incomplete: bool,
}

/// Aggregate results for a whole run. Dialog-scoped failures land in
/// `failed` without making the run itself an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
    pub incomplete: usize,
}

/// The pagination/retry/freshness state machine.
///
/// Strictly sequential: one dialog at a time, one request in flight at a
/// time. Every collaborator is borrowed explicitly; there is no ambient
/// state.
pub struct DumpEngine<'a> {
    cfg: &'a Config,
    client: &'a mut dyn BackendClient,
    sink: &'a mut dyn Dumper,
    progress: &'a mut ProgressStore,
    filter: Option<Regex>,
}

impl<'a> DumpEngine<'a> {
    pub fn new(
        cfg: &'a Config,
        client: &'a mut dyn BackendClient,
        sink: &'a mut dyn Dumper,
        progress: &'a mut ProgressStore,
    ) -> Result<Self> {
        let filter = cfg
            .filter_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("bad filter_regex: {e}")))?;
        Ok(Self {
            cfg,
            client,
            sink,
            progress,
            filter,
        })
    }

    /// Dump every dialog in selector order. A dialog-scoped failure logs,
    /// resets what needs resetting and moves on; only fatal conditions
    /// abort the run.
    pub async fn run(&mut self, dialogs: &[Dialog]) -> Result<RunReport> {
        self.sink.start_backup()?;
        let mut report = RunReport::default();
        for (i, dialog) in dialogs.iter().enumerate() {
            if i > 0 {
                sleep(self.cfg.chunk_delay()).await;
            }
            match self.dump_dialog(dialog).await {
                Ok(outcome) => {
                    report.completed += 1;
                    if outcome.incomplete {
                        report.incomplete += 1;
                    }
                    self.progress.save(self.sink.output_type())?;
                }
                Err(CommandError::TimedOut) => {
                    error!("Unhandled timeout, skipping to next dialog");
                    self.client.reset().await;
                    report.failed += 1;
                }
                Err(CommandError::Disconnected) => {
                    error!("Unhandled disconnect, skipping to next dialog");
                    report.failed += 1;
                }
                Err(CommandError::Failed { command, response }) => {
                    error!("Command <{command}> failed ({response}), skipping to next dialog");
                    report.failed += 1;
                }
                Err(CommandError::Fatal(e)) => return Err(e),
            }
        }
        self.sink.end_backup()?;
        Ok(report)
    }

    async fn dump_dialog(&mut self, dialog: &Dialog) -> CommandResult<DialogOutcome> {
        let media = MediaHandler::new(self.cfg);
        if self.cfg.download_media.any() && self.cfg.copy_media {
            fs::create_dir_all(media.media_dir(dialog)).map_err(Error::from)?;
        }

        let prior = self.progress.snapshot_for(&dialog.id);
        self.sink.start_dialog(dialog, &prior)?;

        let chunk_size = self.cfg.chunk_size;
        let mut prev_id: Option<MsgId> = None;
        let mut offset: u64 = 0;
        let mut accepted: u64 = 0;
        let mut fresh_total = 0usize;
        let mut dropped = 0usize;
        let mut anomalies = 0usize;
        let mut incomplete = false;
        let mut stop: Option<StopReason> = None;

        while stop.is_none() {
            let cur_offset = offset;
            info!(
                "Dumping \"{}\" (range {}-{})",
                dialog.display_name,
                cur_offset + 1,
                cur_offset + chunk_size
            );

            let mut last_fetch_started = Instant::now();
            let chunk = match self
                .fetch_chunk(dialog, cur_offset, &mut last_fetch_started)
                .await?
            {
                Some(chunk) => chunk,
                None => {
                    // Chunk abandoned: consume the offset window anyway so a
                    // later run does not retry the same offset forever.
                    incomplete = true;
                    offset += chunk_size;
                    Vec::new()
                }
            };

            let mut fresh: Vec<Value> = Vec::new();
            for msg in chunk.into_iter().rev() {
                offset += 1;

                let Some(msg_id) = msg.get("id").and_then(MsgId::from_value) else {
                    warn!("Dropping message without id: {msg}");
                    dropped += 1;
                    continue;
                };
                if msg.get("date").and_then(Value::as_i64).is_none() {
                    warn!("Dropping message without date: {msg}");
                    dropped += 1;
                    continue;
                }

                // Log-only: backend-side duplicates and gaps never halt the
                // dump.
                if let Some(prev) = prev_id {
                    if msg_id >= prev {
                        warn!(
                            "Message ids are not sequential ({}[{}] -> {}[{}])",
                            prev.raw_hex(),
                            prev.sequence_hex(),
                            msg_id.raw_hex(),
                            msg_id.sequence_hex()
                        );
                        anomalies += 1;
                    }
                }
                prev_id = Some(msg_id);

                if !self.sink.msg_fresh(&msg, &prior) {
                    info!("Reached end of new messages since last backup");
                    stop = Some(StopReason::Stale);
                    break;
                }

                if let (Some(filter), Some(text)) =
                    (&self.filter, msg.get("text").and_then(Value::as_str))
                {
                    if filter.is_match(text) {
                        continue;
                    }
                }

                fresh.push(msg);
                accepted += 1;

                if self.cfg.backlog_limit > 0 && accepted >= self.cfg.backlog_limit {
                    info!("Reached backlog limit");
                    stop = Some(StopReason::LimitReached);
                    break;
                }
            }
            // Restore chronological order for media handling and the sink.
            fresh.reverse();

            for msg in fresh.iter_mut() {
                media.process(&mut *self.client, dialog, msg).await?;
            }
            if !fresh.is_empty() {
                self.sink.dump_chunk(dialog, &fresh)?;
            }
            for msg in &fresh {
                self.progress.update(&dialog.id, msg);
            }
            fresh_total += fresh.len();

            if stop.is_none() && offset < cur_offset + chunk_size {
                stop = Some(StopReason::Exhausted);
            }
            if stop.is_none() {
                // Pace requests against the backend, measured from the
                // start of the previous fetch attempt.
                if let Some(rest) = self
                    .cfg
                    .chunk_delay()
                    .checked_sub(last_fetch_started.elapsed())
                {
                    sleep(rest).await;
                }
            }
        }

        let state = self.sink.end_dialog(dialog)?;
        self.progress.set_dumper_state(
            &dialog.id,
            state.unwrap_or_else(|| Value::Object(Default::default())),
        );

        Ok(DialogOutcome {
            stop: stop.unwrap_or(StopReason::Exhausted),
            fresh: fresh_total,
            dropped,
            anomalies,
            incomplete,
        })
    }

    /// One chunk under the bounded retry loop. `None` means the retries
    /// were exhausted and the chunk is to be treated as empty.
    async fn fetch_chunk(
        &mut self,
        dialog: &Dialog,
        cur_offset: u64,
        last_fetch_started: &mut Instant,
    ) -> CommandResult<Option<Vec<Value>>> {
        let args = [
            dialog.display_name.clone(),
            self.cfg.chunk_size.to_string(),
            cur_offset.to_string(),
        ];
        let mut retries = 0;
        loop {
            if retries >= self.cfg.chunk_retry {
                error!(
                    "Failed to fetch chunk of {} messages from offset {} after retrying {} times. \
                     Dump of \"{}\" is incomplete.",
                    self.cfg.chunk_size, cur_offset, retries, dialog.display_name
                );
                return Ok(None);
            }
            *last_fetch_started = Instant::now();
            match timeout(
                self.cfg.chunk_timeout(),
                self.client.execute("history", &args),
            )
            .await
            {
                Ok(Ok(Value::Array(chunk))) => return Ok(Some(chunk)),
                Ok(Ok(_)) => {
                    retries += 1;
                    warn!(
                        "Backend returned a non-array chunk, retrying... ({retries}/{})",
                        self.cfg.chunk_retry
                    );
                }
                Ok(Err(CommandError::Disconnected)) => {
                    retries += 1;
                    warn!("Disconnected, retrying... ({retries}/{})", self.cfg.chunk_retry);
                }
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    retries += 1;
                    warn!("Timeout, retrying... ({retries}/{})", self.cfg.chunk_retry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogKind;
    use crate::progress::PROGRESS_FILE;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::time::Duration;

    enum FakeResponse {
        Ready(CommandResult<Value>),
        Hang,
    }

    struct FakeBackend {
        responses: VecDeque<FakeResponse>,
        calls: Vec<(String, Vec<String>)>,
    }

    impl FakeBackend {
        fn new(responses: Vec<FakeResponse>) -> Self {
            Self {
                responses: responses.into(),
                calls: Vec::new(),
            }
        }

        fn history_offsets(&self) -> Vec<String> {
            self.calls
                .iter()
                .filter(|(cmd, _)| cmd == "history")
                .map(|(_, args)| args[2].clone())
                .collect()
        }
    }

    #[async_trait]
    impl BackendClient for FakeBackend {
        async fn execute(&mut self, command: &str, args: &[String]) -> CommandResult<Value> {
            self.calls.push((command.to_string(), args.to_vec()));
            match self.responses.pop_front() {
                Some(FakeResponse::Ready(r)) => r,
                Some(FakeResponse::Hang) => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Array(vec![]))
                }
                // Out of scripted history: the backend is exhausted.
                None => Ok(Value::Array(vec![])),
            }
        }

        async fn reset(&mut self) {}
    }

    #[derive(Default)]
    struct FakeDumper {
        started: Vec<String>,
        chunks: Vec<(String, Vec<u64>)>,
        ended: Vec<String>,
        backup_ended: bool,
    }

    impl Dumper for FakeDumper {
        fn output_type(&self) -> &'static str {
            "fake"
        }

        fn start_backup(&mut self) -> Result<()> {
            Ok(())
        }

        fn start_dialog(&mut self, dialog: &Dialog, _prior: &crate::progress::DumpProgress) -> Result<()> {
            self.started.push(dialog.id.clone());
            Ok(())
        }

        fn msg_fresh(&self, msg: &Value, prior: &crate::progress::DumpProgress) -> bool {
            let Some(last_id) = prior.last_id else {
                return true;
            };
            msg.get("id")
                .and_then(MsgId::from_value)
                .map_or(true, |id| id > last_id)
        }

        fn dump_chunk(&mut self, dialog: &Dialog, messages: &[Value]) -> Result<()> {
            let ids = messages
                .iter()
                .map(|m| m["id"].as_u64().unwrap())
                .collect();
            self.chunks.push((dialog.id.clone(), ids));
            Ok(())
        }

        fn end_dialog(&mut self, dialog: &Dialog) -> Result<Option<Value>> {
            self.ended.push(dialog.id.clone());
            Ok(None)
        }

        fn end_backup(&mut self) -> Result<()> {
            self.backup_ended = true;
            Ok(())
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            backup_dir: dir.to_path_buf(),
            chunk_size: 2,
            chunk_retry: 2,
            chunk_timeout_secs: 0.05,
            chunk_delay_secs: 0.0,
            ..Config::default()
        }
    }

    fn dialog(id: &str) -> Dialog {
        Dialog {
            id: id.to_string(),
            kind: DialogKind::User,
            display_name: format!("dialog_{id}"),
            peer_key: None,
        }
    }

    fn msg(id: u64) -> Value {
        json!({"id": id, "date": id * 10, "text": format!("message {id}")})
    }

    fn chunk(ids: &[u64]) -> FakeResponse {
        FakeResponse::Ready(Ok(Value::Array(ids.iter().map(|&id| msg(id)).collect())))
    }

    fn seeded_store(cfg: &Config, dialog_id: &str, last_id: u64) -> ProgressStore {
        let contents = json!({
            "dumper": "fake",
            "dialogs": {dialog_id: {"last_id": last_id, "last_date": last_id * 10}}
        });
        fs::write(cfg.backup_dir.join(PROGRESS_FILE), contents.to_string()).unwrap();
        ProgressStore::load(cfg, "fake").unwrap()
    }

    #[tokio::test]
    async fn rerun_with_no_new_messages_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = seeded_store(&cfg, "1", 10);
        // Newest message is the already-archived boundary.
        let mut backend = FakeBackend::new(vec![chunk(&[9, 10])]);
        let mut sink = FakeDumper::default();

        let report = {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap()
        };

        assert_eq!(report.completed, 1);
        assert!(sink.chunks.is_empty());
        assert_eq!(backend.history_offsets(), vec!["0"]);
    }

    #[tokio::test]
    async fn stale_boundary_mid_chunk_still_commits_newer_messages() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            chunk_size: 4,
            ..test_config(dir.path())
        };
        let mut progress = seeded_store(&cfg, "1", 5);
        let mut backend = FakeBackend::new(vec![chunk(&[4, 5, 6, 7])]);
        let mut sink = FakeDumper::default();

        {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap();
        }

        // Only the messages newer than the boundary, back in chronological
        // order.
        assert_eq!(sink.chunks, vec![("1".to_string(), vec![6, 7])]);
        assert_eq!(progress.snapshot_for("1").last_id, Some(MsgId::new(5)));
    }

    #[tokio::test]
    async fn non_array_chunks_retry_up_to_the_bound_then_advance_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![
            FakeResponse::Ready(Ok(json!({"event": "nonsense"}))),
            FakeResponse::Ready(Ok(json!(null))),
            chunk(&[]),
        ]);
        let mut sink = FakeDumper::default();

        let report = {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap()
        };

        // Two failed attempts at offset 0, then one clean fetch at the next
        // offset which ends the dialog.
        assert_eq!(backend.history_offsets(), vec!["0", "0", "2"]);
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn hung_fetches_count_as_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![
            FakeResponse::Hang,
            FakeResponse::Hang,
            chunk(&[]),
        ]);
        let mut sink = FakeDumper::default();

        let report = {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap()
        };

        assert_eq!(backend.history_offsets(), vec!["0", "0", "2"]);
        assert_eq!(report.incomplete, 1);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            chunk_size: 3,
            ..test_config(dir.path())
        };
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![FakeResponse::Ready(Ok(json!([
            {"date": 10, "text": "no id"},
            {"id": 2, "text": "no date"},
            {"id": 3, "date": 30, "text": "fine"},
        ])))]);
        let mut sink = FakeDumper::default();

        {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap();
        }

        assert_eq!(sink.chunks, vec![("1".to_string(), vec![3])]);
        let record = {
            // Live state is what save() would persist.
            progress.save("fake").unwrap();
            ProgressStore::load(&cfg, "fake").unwrap().snapshot_for("1")
        };
        assert_eq!(record.last_id, Some(MsgId::new(3)));
        assert_eq!(record.last_date, Some(30));
    }

    #[tokio::test]
    async fn backlog_limit_is_inclusive_and_skips_filtered_messages() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            chunk_size: 3,
            backlog_limit: 2,
            filter_regex: Some("spam".to_string()),
            ..test_config(dir.path())
        };
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![FakeResponse::Ready(Ok(json!([
            {"id": 1, "date": 10, "text": "oldest"},
            {"id": 2, "date": 20, "text": "buy spam now"},
            {"id": 3, "date": 30, "text": "newest"},
        ])))]);
        let mut sink = FakeDumper::default();

        {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1")]).await.unwrap();
        }

        // The filtered message neither reaches the sink nor counts toward
        // the cap; the cap includes its terminating message.
        assert_eq!(sink.chunks, vec![("1".to_string(), vec![1, 3])]);
        assert_eq!(backend.history_offsets(), vec!["0"]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_archived_with_an_anomaly_count() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![chunk(&[5, 5])]);
        let mut sink = FakeDumper::default();

        let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
        let outcome = engine.dump_dialog(&dialog("1")).await.unwrap();

        assert_eq!(outcome.anomalies, 1);
        assert_eq!(outcome.fresh, 2);
        drop(engine);
        assert_eq!(sink.chunks, vec![("1".to_string(), vec![5, 5])]);
    }

    #[tokio::test]
    async fn command_failure_skips_the_dialog_but_not_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![
            FakeResponse::Ready(Err(CommandError::Failed {
                command: "history dialog_1 2 0".to_string(),
                response: json!({"result": "FAIL"}),
            })),
            chunk(&[1]),
        ]);
        let mut sink = FakeDumper::default();

        let report = {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1"), dialog("2")]).await.unwrap()
        };

        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        // The failed dialog was started but never finalized.
        assert_eq!(sink.started, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(sink.chunks, vec![("2".to_string(), vec![1])]);
        assert_eq!(sink.ended, vec!["2".to_string()]);
        assert!(sink.backup_ended);
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![FakeResponse::Ready(Err(CommandError::Fatal(
            Error::Fatal("no connection attempts left, aborting".to_string()),
        )))]);
        let mut sink = FakeDumper::default();

        let err = {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1"), dialog("2")]).await.unwrap_err()
        };

        assert!(matches!(err, Error::Fatal(_)));
        assert!(!sink.backup_ended);
    }

    #[tokio::test]
    async fn progress_is_saved_after_each_completed_dialog() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut progress = ProgressStore::load(&cfg, "fake").unwrap();
        let mut backend = FakeBackend::new(vec![chunk(&[4]), chunk(&[9])]);
        let mut sink = FakeDumper::default();

        {
            let mut engine = DumpEngine::new(&cfg, &mut backend, &mut sink, &mut progress).unwrap();
            engine.run(&[dialog("1"), dialog("2")]).await.unwrap();
        }

        let reloaded = ProgressStore::load(&cfg, "fake").unwrap();
        assert_eq!(reloaded.snapshot_for("1").last_id, Some(MsgId::new(4)));
        assert_eq!(reloaded.snapshot_for("2").last_id, Some(MsgId::new(9)));
        // The sink returned no state; an empty blob is recorded.
        assert_eq!(reloaded.snapshot_for("1").dumper_state, json!({}));
    }
}
