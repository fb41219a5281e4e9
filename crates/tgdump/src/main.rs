use std::fs;

use anyhow::Context;
use tracing::info;

use tgdump_core::{
    config::Config,
    dialog::{format_dialog_list, select_dialogs},
    engine::DumpEngine,
    progress::ProgressStore,
    sink::Dumper,
};
use tgdump_jsonl::JsonLinesDumper;
use tgdump_tgcli::TgCliClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tgdump_core::logging::init("tgdump")?;

    let config_path = Config::default_path();
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    fs::create_dir_all(&cfg.backup_dir)
        .with_context(|| format!("creating {}", cfg.backup_dir.display()))?;

    let mut sink = JsonLinesDumper::new(&cfg.backup_dir);
    // The progress/sink identity check must fail before any socket work.
    let mut progress = ProgressStore::load(&cfg, sink.output_type())?;

    let mut client = TgCliClient::new(&cfg);
    client.connect().await?;

    let selection = select_dialogs(client.listing(), &cfg);
    info!(
        "Skipping {} dialogs: {}",
        selection.excluded.len(),
        format_dialog_list(&selection.excluded)
    );
    info!(
        "Backing up {} dialogs: {}",
        selection.included.len(),
        format_dialog_list(&selection.included)
    );

    let report = {
        let mut engine = DumpEngine::new(&cfg, &mut client, &mut sink, &mut progress)?;
        engine.run(&selection.included).await?
    };
    if report.failed > 0 || report.incomplete > 0 {
        info!(
            "Dumped {} dialogs ({} failed, {} incomplete)",
            report.completed, report.failed, report.incomplete
        );
    }

    if cfg.kill_backend {
        client.shutdown_backend().await;
    }
    info!("Finished");
    Ok(())
}
