use serde_json::Value;

use crate::{dialog::Dialog, progress::DumpProgress, Result};

/// Port for the durable message sink.
///
/// One concrete implementation today (JSON lines); future formats implement
/// the same surface. Freshness policy lives here because only the sink
/// knows what it already recorded; the engine never inspects the storage
/// shape.
pub trait Dumper {
    /// Identity persisted into the progress file. A mismatch on startup is
    /// a fatal configuration error.
    fn output_type(&self) -> &'static str;

    fn start_backup(&mut self) -> Result<()>;

    fn start_dialog(&mut self, dialog: &Dialog, prior: &DumpProgress) -> Result<()>;

    /// Whether `msg` is new relative to the prior run's snapshot for this
    /// dialog. The first stale message ends pagination for the dialog.
    fn msg_fresh(&self, msg: &Value, prior: &DumpProgress) -> bool;

    /// One fetched chunk's worth of fresh messages, in chronological order.
    fn dump_chunk(&mut self, dialog: &Dialog, messages: &[Value]) -> Result<()>;

    /// May return an opaque state blob; the engine stores it into the
    /// dialog's progress record verbatim.
    fn end_dialog(&mut self, dialog: &Dialog) -> Result<Option<Value>>;

    fn end_backup(&mut self) -> Result<()>;
}
