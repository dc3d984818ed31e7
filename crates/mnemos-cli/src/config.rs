//! Configuration Vault – reads/writes `~/.mnemos/config.toml`.

use mnemos_memory::MemoryConfig;
use mnemos_speaker::SpeakerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted operator configuration stored in `~/.mnemos/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root holding the `conversation/` and `speakers/` store trees.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Dimension of speaker voice embeddings.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Distance below which a voice matches a stored speaker.
    #[serde(default = "default_speaker_threshold")]
    pub speaker_threshold: f32,

    #[serde(default)]
    pub memory: MemoryConfig,
}

fn home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(home()).join(".mnemos").join("data")
}
fn default_embedding_dim() -> usize {
    SpeakerConfig::default().embedding_dim
}
fn default_speaker_threshold() -> f32 {
    SpeakerConfig::default().threshold
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding_dim: default_embedding_dim(),
            speaker_threshold: default_speaker_threshold(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Config {
    pub fn conversation_root(&self) -> PathBuf {
        self.data_dir.join("conversation")
    }

    pub fn speaker_root(&self) -> PathBuf {
        self.data_dir.join("speakers")
    }

    pub fn speaker_config(&self) -> SpeakerConfig {
        SpeakerConfig {
            embedding_dim: self.embedding_dim,
            threshold: self.speaker_threshold,
        }
    }
}

/// Return the path to `~/.mnemos/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mnemos").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `MNEMOS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MNEMOS_DATA_DIR` | `data_dir` |
/// | `MNEMOS_EMBEDDING_DIM` | `embedding_dim` |
/// | `MNEMOS_SPEAKER_THRESHOLD` | `speaker_threshold` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MNEMOS_DATA_DIR") {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MNEMOS_EMBEDDING_DIM")
        && let Ok(dim) = v.parse::<usize>()
        && dim > 0
    {
        cfg.embedding_dim = dim;
    }
    if let Ok(v) = std::env::var("MNEMOS_SPEAKER_THRESHOLD")
        && let Ok(threshold) = v.parse::<f32>()
    {
        cfg.speaker_threshold = threshold;
    }
}

/// Save the config to disk, creating `~/.mnemos/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Conversation history is personal data: owner-only on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_memory_table() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.data_dir = dir.path().join("data");
        cfg.memory.username = "Ada".into();
        cfg.memory.distance_cutoff = Some(0.4);
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.memory.username, "Ada");
        assert_eq!(loaded.memory.distance_cutoff, Some(0.4));
        assert_eq!(loaded.embedding_dim, 192);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "speaker_threshold = 0.7\n[memory]\nmax_tokens = 2000\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.speaker_threshold, 0.7);
        assert_eq!(cfg.memory.max_tokens, 2000);
        assert_eq!(cfg.memory.query_n_max, 3);
    }

    #[test]
    fn config_path_points_to_mnemos_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".mnemos"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_data_dir_and_threshold() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("MNEMOS_DATA_DIR", "/srv/mnemos");
            std::env::set_var("MNEMOS_SPEAKER_THRESHOLD", "0.25");
            std::env::set_var("MNEMOS_EMBEDDING_DIM", "not a number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/mnemos"));
        assert_eq!(cfg.speaker_threshold, 0.25);
        assert_eq!(cfg.embedding_dim, 192);
        unsafe {
            std::env::remove_var("MNEMOS_DATA_DIR");
            std::env::remove_var("MNEMOS_SPEAKER_THRESHOLD");
            std::env::remove_var("MNEMOS_EMBEDDING_DIM");
        }
    }
}
