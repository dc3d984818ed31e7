//! Speaker labels and the text forms they take.
//!
//! Unknown speakers are addressed as `"Unknown Speaker <n>"` where `n` is
//! their record id. Known speakers are stored as `"<name> -- <uuid>"` so two
//! people sharing a display name stay distinct records.

use std::fmt;

use mnemos_types::MonotonicId;
use uuid::Uuid;

use crate::error::{SpeakerError, SpeakerResult};

pub const UNKNOWN_PREFIX: &str = "Unknown Speaker";
const SEPARATOR: &str = " -- ";

/// Who a voice belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpeakerLabel {
    Known(String),
    Unknown(MonotonicId),
}

impl SpeakerLabel {
    pub fn is_known(&self) -> bool {
        matches!(self, SpeakerLabel::Known(_))
    }
}

impl fmt::Display for SpeakerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeakerLabel::Known(name) => f.write_str(name),
            SpeakerLabel::Unknown(id) => write!(f, "{UNKNOWN_PREFIX} {id}"),
        }
    }
}

/// Accept `"Unknown Speaker 3"` (any case) or a bare `"3"`.
pub fn parse_unknown(label: &str) -> SpeakerResult<MonotonicId> {
    let trimmed = label.trim();
    let number = match trimmed.get(..UNKNOWN_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(UNKNOWN_PREFIX) => trimmed[UNKNOWN_PREFIX.len()..].trim(),
        _ => trimmed,
    };
    number
        .parse::<u64>()
        .ok()
        .filter(|&n| n > 0)
        .map(MonotonicId)
        .ok_or_else(|| SpeakerError::InvalidLabel(label.to_string()))
}

/// Names must be non-empty and must not be mistakable for an unknown label.
pub fn validate_name(name: &str) -> SpeakerResult<&str> {
    let name = name.trim();
    let lower = name.to_lowercase();
    if name.is_empty() || lower.contains("unknown") || lower.contains("speaker") {
        return Err(SpeakerError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Stored payload for a newly enrolled known speaker.
pub fn known_payload(name: &str) -> String {
    format!("{name}{SEPARATOR}{}", Uuid::new_v4())
}

/// Display name carried by a known-speaker payload.
pub fn display_name(payload: &str) -> &str {
    payload
        .split_once(SEPARATOR)
        .map_or(payload, |(name, _)| name)
}

/// Substring every payload for `name` contains.
pub(crate) fn payload_prefix(name: &str) -> String {
    format!("{name}{SEPARATOR}")
}
