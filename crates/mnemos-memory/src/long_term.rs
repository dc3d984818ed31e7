//! Long-term memory – one rolling text blob distilled from every summary.
//!
//! Persisted as `long_term_memory.json` in the conversation root. The file is
//! replaced atomically (temp file, `fsync`, rename) so a crash leaves either
//! the old or the new version, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use mnemos_types::MonotonicId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MemoryResult;

pub const LTM_FILE: &str = "long_term_memory.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub content: String,
    /// Newest summary folded into `content`. Summaries above this id are
    /// what triggers the next regeneration.
    #[serde(default)]
    pub through_summary: MonotonicId,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LongTermMemory {
    /// Read the blob under `root`; an absent file is an empty memory.
    pub fn load(root: &Path) -> MemoryResult<Self> {
        let path = root.join(LTM_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, root: &Path) -> MemoryResult<()> {
        let path = root.join(LTM_FILE);
        let tmp = root.join(format!("{LTM_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        #[cfg(unix)]
        File::open(root)?.sync_all()?;
        debug!(through = %self.through_summary, tokens = self.token_count, "long-term memory saved");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
