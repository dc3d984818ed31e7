//! `mnemos-speaker` – who is talking.
//!
//! Maps voice embeddings onto known names or stable "Unknown Speaker <n>"
//! labels, using two [`EmbeddedStore`][mnemos_store::EmbeddedStore]s: one for
//! named voices, one for voices nobody has named yet.
//!
//! # Modules
//!
//! - [`identity`] – [`SpeakerIdentity`]: identification, enrolment,
//!   promotion and removal.
//! - [`label`] – [`SpeakerLabel`] and the text forms of labels and names.

pub mod error;
pub mod identity;
pub mod label;

pub use error::{SpeakerError, SpeakerResult};
pub use identity::{SpeakerConfig, SpeakerIdentity};
pub use label::SpeakerLabel;
