//! Speaker identity – resolves voice embeddings to known names or stable
//! "Unknown Speaker" labels.
//!
//! Two embedded stores live under the speaker root:
//!
//! | path                | payload                | label            |
//! |---------------------|------------------------|------------------|
//! | `known_speakers/`   | `"<name> -- <uuid>"`   | `<name>`         |
//! | `unknown_speakers/` | `"Unknown Speaker"`    | `Unknown Speaker <id>` |
//!
//! Every operation that writes to both stores takes the unknown store's lock
//! first and the known store's second.

use std::path::Path;
use std::sync::Arc;

use mnemos_store::{EmbeddedStore, NewEntry, StoreConfig, StoreError};
use mnemos_types::MonotonicId;
use tracing::{debug, info};

use crate::error::{SpeakerError, SpeakerResult};
use crate::label::{
    SpeakerLabel, UNKNOWN_PREFIX, display_name, known_payload, parse_unknown, payload_prefix,
    validate_name,
};

pub const KNOWN_DIR: &str = "known_speakers";
pub const UNKNOWN_DIR: &str = "unknown_speakers";

const KNOWN_SCOPE: &str = "known";
const UNKNOWN_SCOPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerConfig {
    pub embedding_dim: usize,
    /// A stored voice matches when its distance to the probe is below this.
    pub threshold: f32,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 192,
            threshold: 1.0,
        }
    }
}

pub struct SpeakerIdentity {
    threshold: f32,
    known: Arc<EmbeddedStore>,
    unknown: Arc<EmbeddedStore>,
}

impl SpeakerIdentity {
    /// Open (or create) both stores under `root`.
    pub fn open(root: impl AsRef<Path>, config: &SpeakerConfig) -> SpeakerResult<Self> {
        let root = root.as_ref();
        let known = EmbeddedStore::open(StoreConfig::new(
            root.join(KNOWN_DIR),
            KNOWN_SCOPE,
            config.embedding_dim,
        ))?;
        let unknown = EmbeddedStore::open(StoreConfig::new(
            root.join(UNKNOWN_DIR),
            UNKNOWN_SCOPE,
            config.embedding_dim,
        ))?;
        Ok(Self::with_stores(
            Arc::new(known),
            Arc::new(unknown),
            config.threshold,
        ))
    }

    /// Build on stores that are already open, possibly shared with other
    /// components.
    pub fn with_stores(
        known: Arc<EmbeddedStore>,
        unknown: Arc<EmbeddedStore>,
        threshold: f32,
    ) -> Self {
        Self {
            threshold,
            known,
            unknown,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn known_store(&self) -> &Arc<EmbeddedStore> {
        &self.known
    }

    pub fn unknown_store(&self) -> &Arc<EmbeddedStore> {
        &self.unknown
    }

    /// Resolve `vector` to a known name or an existing unknown label,
    /// enrolling it as a new unknown speaker when nothing is close enough.
    ///
    /// The lookup and the enrolment happen under the unknown store's write
    /// lock, so two processes hearing the same new voice create one label.
    pub fn identify_or_enroll(&self, vector: &[f32]) -> SpeakerResult<SpeakerLabel> {
        let mut unknown = self.unknown.write()?;

        if let Some(name) = self.nearest_known(vector)? {
            return Ok(SpeakerLabel::Known(name));
        }
        if let Some((id, distance)) = unknown.find_nearest(vector)?
            && distance < self.threshold
        {
            debug!(label = %id, distance, "matched unknown speaker");
            return Ok(SpeakerLabel::Unknown(id));
        }

        let id = unknown.add_entry(NewEntry::new(UNKNOWN_PREFIX).with_vector(vector.to_vec()))?;
        info!(label = %id, "new unknown speaker enrolled");
        Ok(SpeakerLabel::Unknown(id))
    }

    /// Resolve `vector` without enrolling anything.
    pub fn identify(&self, vector: &[f32]) -> SpeakerResult<Option<SpeakerLabel>> {
        if let Some(name) = self.nearest_known(vector)? {
            return Ok(Some(SpeakerLabel::Known(name)));
        }
        Ok(self
            .unknown
            .find_nearest(vector)?
            .filter(|(_, distance)| *distance < self.threshold)
            .map(|(id, _)| SpeakerLabel::Unknown(id)))
    }

    fn nearest_known(&self, vector: &[f32]) -> SpeakerResult<Option<String>> {
        let Some((id, distance)) = self.known.find_nearest(vector)? else {
            return Ok(None);
        };
        if distance >= self.threshold {
            return Ok(None);
        }
        // A concurrent `forget` may have removed the hit in between.
        let name = self
            .known
            .get(id)?
            .map(|record| display_name(&record.payload).to_string());
        if let Some(name) = &name {
            debug!(name = %name, distance, "matched known speaker");
        }
        Ok(name)
    }

    /// Move an unknown speaker's voice into the known store under `name`.
    pub fn promote(&self, label: &str, name: &str) -> SpeakerResult<SpeakerLabel> {
        let name = validate_name(name)?;
        let id = parse_unknown(label)?;

        let mut unknown = self.unknown.write()?;
        let record = unknown.get(id)?.ok_or(SpeakerError::UnknownLabel(id))?;
        let vector = record.vector.ok_or_else(|| {
            StoreError::Corruption(format!("unknown speaker {id} has no embedding"))
        })?;

        let mut known = self.known.write()?;
        let known_id = known.add_entry(NewEntry::new(known_payload(name)).with_vector(vector))?;
        unknown.remove_entry(id)?;

        info!(label = %id, name, known_id = %known_id, "unknown speaker promoted");
        Ok(SpeakerLabel::Known(name.to_string()))
    }

    /// Enroll a voice directly as `name`. With `unique`, refuse when a known
    /// speaker already carries that name.
    pub fn enroll_known(&self, name: &str, vector: &[f32], unique: bool) -> SpeakerResult<MonotonicId> {
        let name = validate_name(name)?;
        let mut known = self.known.write()?;
        if unique
            && known
                .find_by_substring(&payload_prefix(name))?
                .iter()
                .any(|r| display_name(&r.payload) == name)
        {
            return Err(SpeakerError::NameExists(name.to_string()));
        }
        let id = known.add_entry(NewEntry::new(known_payload(name)).with_vector(vector.to_vec()))?;
        info!(name, id = %id, "known speaker enrolled");
        Ok(id)
    }

    /// Remove every known voice filed under `name`; returns how many.
    pub fn forget(&self, name: &str) -> SpeakerResult<usize> {
        let name = name.trim();
        let mut known = self.known.write()?;
        let ids: Vec<MonotonicId> = known
            .find_by_substring(&payload_prefix(name))?
            .into_iter()
            .filter(|r| display_name(&r.payload) == name)
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return Err(SpeakerError::NameNotFound(name.to_string()));
        }
        for id in &ids {
            known.remove_entry(*id)?;
        }
        info!(name, removed = ids.len(), "known speaker forgotten");
        Ok(ids.len())
    }

    /// The stored embedding behind an unknown label.
    pub fn unknown_embedding(&self, label: &str) -> SpeakerResult<Vec<f32>> {
        let id = parse_unknown(label)?;
        self.unknown
            .get(id)?
            .and_then(|r| r.vector)
            .ok_or(SpeakerError::UnknownLabel(id))
    }

    /// Distinct known display names, sorted.
    pub fn known_names(&self) -> SpeakerResult<Vec<String>> {
        let mut names: Vec<String> = self
            .known
            .all()?
            .iter()
            .map(|r| display_name(&r.payload).to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Every unknown label, ascending.
    pub fn unknown_labels(&self) -> SpeakerResult<Vec<SpeakerLabel>> {
        Ok(self
            .unknown
            .all()?
            .into_iter()
            .map(|r| SpeakerLabel::Unknown(r.id))
            .collect())
    }
}
