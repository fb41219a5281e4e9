use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Error;

/// Failure taxonomy for backend commands.
///
/// The engine applies a different retry policy per kind, so the socket
/// adapter must keep these distinct instead of collapsing them into one
/// error string.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The control socket dropped mid-exchange. The transport has been torn
    /// down; the next command reconnects.
    #[error("backend disconnected")]
    Disconnected,

    /// A bounded wait elapsed. Produced by the timeout wrappers at the
    /// engine's call sites, not by the adapter itself.
    #[error("backend command timed out")]
    TimedOut,

    /// The backend answered with its failure marker; the connection itself
    /// is fine.
    #[error("command <{command}> failed: {response}")]
    Failed { command: String, response: Value },

    /// Not recoverable at any level; aborts the run.
    #[error(transparent)]
    Fatal(#[from] Error),
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Port for the backend control connection.
///
/// `execute` must ensure the transport is connected before writing, so a
/// single call may implicitly perform connection setup (the fatal connect
/// window applies there).
#[async_trait]
pub trait BackendClient: Send {
    async fn execute(&mut self, command: &str, args: &[String]) -> CommandResult<Value>;

    /// Drop the connection after an unhandled failure; the next `execute`
    /// starts from a clean connect.
    async fn reset(&mut self);
}
