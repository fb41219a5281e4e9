use std::collections::HashSet;
use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::config::{AllowEntry, Config};
use crate::utils::{normalize_for_match, scalar_to_string};

/// Channel flag bit telegram-cli sets on megagroup channels.
const MEGAGROUP_FLAG: i64 = 1 << 12;

/// One conversation from the backend listing, normalized for the run.
///
/// Identity is fixed at selection time; `display_name` is synthesized from
/// the raw kind and id when the backend reports none (deleted accounts).
#[derive(Clone, Debug)]
pub struct Dialog {
    pub id: String,
    pub kind: DialogKind,
    pub display_name: String,
    /// Dedup key: supergroups show up in both the dialog and the channel
    /// listing under the same peer id.
    pub peer_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialogKind {
    User,
    Group,
    Channel,
    Supergroup,
    Unknown(String),
}

impl DialogKind {
    fn classify(raw_kind: &str, flags: i64) -> Self {
        match raw_kind {
            "user" => Self::User,
            "chat" => Self::Group,
            "channel" if flags & MEGAGROUP_FLAG != 0 => Self::Supergroup,
            "channel" => Self::Channel,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for DialogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
            Self::Channel => write!(f, "channel"),
            Self::Supergroup => write!(f, "supergroup"),
            Self::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

impl Dialog {
    /// Normalize one raw listing entry. Newer backends report `peer_id` /
    /// `peer_type`; those win over the legacy fields.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let id = raw
            .get("peer_id")
            .or_else(|| raw.get("id"))
            .and_then(scalar_to_string)?;
        let kind_raw = raw
            .get("peer_type")
            .or_else(|| raw.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let flags = raw.get("flags").and_then(Value::as_i64).unwrap_or(0);
        let peer_key = raw.get("peer_id").and_then(scalar_to_string);
        let display_name = raw
            .get("print_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind_raw}#{id}"));
        Some(Self {
            id,
            kind: DialogKind::classify(&kind_raw, flags),
            display_name,
            peer_key,
        })
    }
}

/// Result of filtering the raw listing, both halves in discovery order.
#[derive(Debug, Default)]
pub struct Selection {
    pub included: Vec<Dialog>,
    pub excluded: Vec<Dialog>,
}

/// Dedup, classify, and filter the raw backend listing against the
/// configured allow-lists.
pub fn select_dialogs(raw: &[Value], cfg: &Config) -> Selection {
    let mut seen = HashSet::new();
    let mut selection = Selection::default();
    for entry in raw {
        let Some(dialog) = Dialog::from_value(entry) else {
            warn!("Ignoring listing entry without an id: {entry}");
            continue;
        };
        if let Some(key) = &dialog.peer_key {
            if !seen.insert(key.clone()) {
                continue;
            }
        }
        if is_backup_target(&dialog, cfg) {
            selection.included.push(dialog);
        } else {
            selection.excluded.push(dialog);
        }
    }
    selection
}

fn is_backup_target(dialog: &Dialog, cfg: &Config) -> bool {
    let candidates = match &dialog.kind {
        DialogKind::User => &cfg.backup_users,
        DialogKind::Group => &cfg.backup_groups,
        DialogKind::Channel => &cfg.backup_channels,
        DialogKind::Supergroup => &cfg.backup_supergroups,
        DialogKind::Unknown(raw) => {
            warn!("Unknown type \"{raw}\" for dialog \"{}\"", dialog.display_name);
            return false;
        }
    };
    let Some(candidates) = candidates else {
        return false;
    };
    if candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|c| entry_matches(c, dialog))
}

fn entry_matches(entry: &AllowEntry, dialog: &Dialog) -> bool {
    match entry {
        AllowEntry::Id(id) => id.to_string() == dialog.id,
        AllowEntry::Name(name) => {
            if name == &dialog.id {
                return true;
            }
            let candidate = normalize_for_match(name);
            normalize_for_match(&dialog.display_name).contains(&candidate)
        }
    }
}

/// Quoted names for the one-shot pre-run summary.
pub fn format_dialog_list(dialogs: &[Dialog]) -> String {
    if dialogs.is_empty() {
        return "(none)".to_string();
    }
    dialogs
        .iter()
        .map(|d| format!("\"{}\"", d.display_name))
        .collect::<Vec<_>>()
        .join(", ")
}
