//! telegram-cli control socket adapter.
//!
//! Implements the core backend port over the line-oriented command
//! protocol: one command line out, three lines back (status line, JSON
//! payload, blank terminator).

mod transport;

pub use transport::{Endpoint, Transport};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use tgdump_core::{
    backend::{BackendClient, CommandError, CommandResult},
    config::Config,
    errors::Error,
};

/// Fixed delay between connection attempts inside the connect window.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct TgCliClient {
    transport: Transport,
    maximum_dialogs: u64,
    listing: Vec<Value>,
}

impl TgCliClient {
    pub fn new(cfg: &Config) -> Self {
        let transport = Transport::new(
            Endpoint::from_config(cfg),
            cfg.conn_timeout(),
            CONNECT_RETRY_DELAY,
        );
        Self::with_transport(transport, cfg.maximum_dialogs)
    }

    pub fn with_transport(transport: Transport, maximum_dialogs: u64) -> Self {
        Self {
            transport,
            maximum_dialogs,
            listing: Vec::new(),
        }
    }

    /// Establish the connection (and the initial dialog listing) up front.
    pub async fn connect(&mut self) -> CommandResult<()> {
        self.ensure_connected().await
    }

    /// The combined dialog + channel listing fetched on the most recent
    /// fresh connection.
    pub fn listing(&self) -> &[Value] {
        &self.listing
    }

    /// Best-effort `quit`. The backend answers by closing the socket, so no
    /// response is read.
    pub async fn shutdown_backend(&mut self) {
        if self.ensure_connected().await.is_err() {
            return;
        }
        let _ = self.transport.write_line("quit").await;
        self.transport.disconnect().await;
    }

    async fn ensure_connected(&mut self) -> CommandResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect().await?;
        // A reconnect may be a whole new backend session; refresh the
        // cached listing before running anything else over it.
        self.refresh_listing().await
    }

    async fn refresh_listing(&mut self) -> CommandResult<()> {
        let max = self.maximum_dialogs.to_string();
        let dialogs = self.raw_execute("dialog_list", &[max.clone()]).await?;
        let channels = self.raw_execute("channel_list", &[max]).await?;
        let (Value::Array(mut dialogs), Value::Array(mut channels)) = (dialogs, channels) else {
            return Err(Error::Fatal("expected array of dialogs and channels".to_string()).into());
        };
        dialogs.append(&mut channels);
        if dialogs.is_empty() {
            return Err(Error::Fatal("no dialogs found".to_string()).into());
        }
        self.listing = dialogs;
        Ok(())
    }

    async fn raw_execute(&mut self, command: &str, args: &[String]) -> CommandResult<Value> {
        let mut command_line = command.to_string();
        for arg in args {
            command_line.push(' ');
            command_line.push_str(arg);
        }

        let payload = match self.exchange(&command_line).await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Disconnected from socket, will attempt to reconnect ({e})");
                self.transport.disconnect().await;
                return Err(CommandError::Disconnected);
            }
        };

        let json: Value = serde_json::from_str(&payload).map_err(|e| {
            CommandError::Fatal(Error::Fatal(format!(
                "unparseable response to <{command_line}>: {e}"
            )))
        })?;
        if json.get("result").and_then(Value::as_str) == Some("FAIL") {
            return Err(CommandError::Failed {
                command: command_line,
                response: json,
            });
        }
        Ok(json)
    }

    /// The wire exchange. The first response line is an undocumented status
    /// code and the last a terminator; only the middle line carries the
    /// response object.
    async fn exchange(&mut self, command_line: &str) -> std::io::Result<String> {
        self.transport.write_line(command_line).await?;
        self.transport.read_line().await?;
        let payload = self.transport.read_line().await?;
        self.transport.read_line().await?;
        Ok(payload)
    }
}

#[async_trait]
impl BackendClient for TgCliClient {
    async fn execute(&mut self, command: &str, args: &[String]) -> CommandResult<Value> {
        self.ensure_connected().await?;
        self.raw_execute(command, args).await
    }

    async fn reset(&mut self) {
        self.transport.disconnect().await;
    }
}
