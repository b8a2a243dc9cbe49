//! Load config from file, environment and command line.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: `--config`, ~/.config/revenant/config.toml or /etc/revenant/config.toml.
/// Env overrides: REVENANT_USERNAME, REVENANT_ROOM_SECRET, REVENANT_PORT, REVENANT_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name; also the self-suppression key.
    #[serde(default = "default_username")]
    pub username: String,
    /// Shared secret. Peers with the same secret form a room.
    #[serde(default = "default_room_secret")]
    pub room_secret: String,
    /// UDP port for both bind and broadcast (default 47777).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_username() -> String {
    "Anonymous".to_owned()
}
fn default_room_secret() -> String {
    "default".to_owned()
}
fn default_port() -> u16 {
    47777
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/revenant/received_files"),
        None => PathBuf::from("received_files"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: default_username(),
            room_secret: default_room_secret(),
            port: default_port(),
            download_dir: default_download_dir(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("room secret must not be empty")]
    EmptySecret,
}

/// Command-line values; `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub username: Option<String>,
    pub room_secret: Option<String>,
    pub port: Option<u16>,
    pub download_dir: Option<PathBuf>,
}

/// Load config: defaults, then config file, then env vars, then command line.
pub fn load(overrides: &Overrides) -> Result<Config, ConfigError> {
    load_with(overrides, &config_paths(), |key| std::env::var(key).ok())
}

fn load_with(
    overrides: &Overrides,
    default_paths: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut c = match &overrides.config {
        Some(path) => read_file(path)?,
        None => load_file(default_paths).unwrap_or_default(),
    };
    apply_env(&mut c, env);
    if let Some(v) = &overrides.username {
        c.username = v.clone();
    }
    if let Some(v) = &overrides.room_secret {
        c.room_secret = v.clone();
    }
    if let Some(p) = overrides.port {
        c.port = p;
    }
    if let Some(d) = &overrides.download_dir {
        c.download_dir = d.clone();
    }
    validate(c)
}

fn apply_env(c: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(s) = env("REVENANT_USERNAME") {
        c.username = s;
    }
    if let Some(s) = env("REVENANT_ROOM_SECRET") {
        c.room_secret = s;
    }
    if let Some(s) = env("REVENANT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid REVENANT_PORT"),
        }
    }
    if let Some(s) = env("REVENANT_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn validate(mut c: Config) -> Result<Config, ConfigError> {
    c.username = c.username.trim().to_owned();
    if c.username.is_empty() {
        return Err(ConfigError::EmptyUsername);
    }
    if c.room_secret.is_empty() {
        return Err(ConfigError::EmptySecret);
    }
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/revenant/config.toml"));
    }
    out.push(PathBuf::from("/etc/revenant/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// First existing default-location file. A broken one is logged and skipped.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    for p in paths {
        if p.exists() {
            match read_file(p) {
                Ok(c) => {
                    tracing::debug!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Err(e) => tracing::warn!(error = %e, "skipping config file"),
            }
            break;
        }
    }
    None
}
