use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message identifier as reported by the backend.
///
/// Newer telegram-cli builds pack a peer marker into the high 32 bits and a
/// per-peer sequence counter into the low 32 bits. Ordering is raw numeric
/// order; the split only matters for anomaly diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(u64);

impl MsgId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Accepts both numeric and decimal-string ids. Anything else (missing,
    /// empty, negative, non-numeric) is no identifier at all.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_u64().map(Self),
            Value::String(s) => s.trim().parse::<u64>().ok().map(Self),
            _ => None,
        }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sequence(&self) -> u32 {
        self.0 as u32
    }

    pub fn raw_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn sequence_hex(&self) -> String {
        format!("{:08x}", self.sequence())
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
