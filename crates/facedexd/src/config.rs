use facedex_core::{MatchPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_BIND: &str = "0.0.0.0:5000";
const DEFAULT_DETECTION_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which embedding store backs the daemon. Exactly one is used per process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend {other:?} (expected sqlite or memory)")),
        }
    }
}

/// Daemon configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: SocketAddr,
    pub store: StoreBackend,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match. Smaller is stricter.
    pub match_threshold: f32,
    pub match_policy: MatchPolicy,
    /// Minimum SCRFD score for a face to be considered.
    pub detection_threshold: f32,
    /// Largest accepted request body.
    pub max_upload_bytes: usize,
}

/// Optional TOML file; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    store: Option<StoreBackend>,
    db_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    detection_threshold: Option<f32>,
    max_upload_bytes: Option<usize>,
}

impl Config {
    /// Load from the TOML file named by `FACEDEX_CONFIG` (if any), then apply
    /// `FACEDEX_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("FACEDEX_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = facedex_core::data_home().join("facedex");

        let bind = env("FACEDEX_BIND")
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            key: "bind",
            reason: format!("{bind:?}: {e}"),
        })?;

        let store = match env("FACEDEX_STORE") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid { key: "store", reason })?,
            None => file.store.unwrap_or_default(),
        };

        let match_policy = match env("FACEDEX_MATCH_POLICY") {
            Some(v) => v
                .parse()
                .map_err(|reason| ConfigError::Invalid { key: "match_policy", reason })?,
            None => file.match_policy.unwrap_or_default(),
        };

        // MATCH_THRESHOLD is the historical name of the setting.
        let match_threshold = env_parse(&env, "FACEDEX_MATCH_THRESHOLD")
            .or_else(|| env_parse(&env, "MATCH_THRESHOLD"))
            .or(file.match_threshold)
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        if !match_threshold.is_finite() || match_threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{match_threshold} is not a positive distance"),
            });
        }

        let detection_threshold = env_parse(&env, "FACEDEX_DETECTION_THRESHOLD")
            .or(file.detection_threshold)
            .unwrap_or(DEFAULT_DETECTION_THRESHOLD);
        if !(0.0..1.0).contains(&detection_threshold) {
            return Err(ConfigError::Invalid {
                key: "detection_threshold",
                reason: format!("{detection_threshold} is outside [0, 1)"),
            });
        }

        Ok(Self {
            bind,
            store,
            db_path: env("FACEDEX_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("faces.db")),
            model_dir: env("FACEDEX_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(facedex_core::default_model_dir),
            match_threshold,
            match_policy,
            detection_threshold,
            max_upload_bytes: env_parse(&env, "FACEDEX_MAX_UPLOAD_BYTES")
                .or(file.max_upload_bytes)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        })
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a numeric variable; unparsable values fall back to the next source.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind, "0.0.0.0:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.store, StoreBackend::Sqlite);
        assert_eq!(config.match_threshold, 0.47);
        assert_eq!(config.match_policy, MatchPolicy::Nearest);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.db_path.ends_with("facedex/faces.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FACEDEX_BIND", "127.0.0.1:8080"),
            ("FACEDEX_STORE", "memory"),
            ("FACEDEX_MATCH_THRESHOLD", "0.6"),
            ("FACEDEX_MATCH_POLICY", "first"),
            ("FACEDEX_DB_PATH", "/var/lib/facedex/faces.db"),
        ]))
        .unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facedex/faces.db"));
    }

    #[test]
    fn test_legacy_threshold_variable() {
        let config = Config::from_lookup(lookup(&[("MATCH_THRESHOLD", "0.4")])).unwrap();
        assert_eq!(config.match_threshold, 0.4);

        let both = Config::from_lookup(lookup(&[
            ("MATCH_THRESHOLD", "0.4"),
            ("FACEDEX_MATCH_THRESHOLD", "0.5"),
        ]))
        .unwrap();
        assert_eq!(both.match_threshold, 0.5);
    }

    #[test]
    fn test_unparsable_threshold_falls_back() {
        let config =
            Config::from_lookup(lookup(&[("FACEDEX_MATCH_THRESHOLD", "tight")])).unwrap();
        assert_eq!(config.match_threshold, DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("FACEDEX_MATCH_THRESHOLD", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FACEDEX_STORE", "mongo")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FACEDEX_BIND", "nowhere")])).is_err());
    }

    #[test]
    fn test_file_then_env() {
        let dir = std::env::temp_dir().join(format!("facedex-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("facedex.toml");
        std::fs::write(
            &path,
            "store = \"memory\"\nmatch_threshold = 0.55\nmatch_policy = \"first\"\n",
        )
        .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::from_lookup(lookup(&[
            ("FACEDEX_CONFIG", path_str.as_str()),
            ("FACEDEX_MATCH_THRESHOLD", "0.3"),
        ]))
        .unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert_eq!(config.match_threshold, 0.3);

        std::fs::write(&path, "threshold = 0.5\n").unwrap();
        let err = Config::from_lookup(lookup(&[("FACEDEX_CONFIG", path_str.as_str())])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        std::fs::remove_dir_all(&dir).ok();
    }
}
