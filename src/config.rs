use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DB_SECRET_NAME: &str = "DB_SECRET_NAME";
pub const DB_HOST: &str = "DB_HOST";
pub const DB_PORT: &str = "DB_PORT";
pub const DB_NAME: &str = "DB_NAME";
pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_CONNECT_TIMEOUT_SECS: &str = "DB_CONNECT_TIMEOUT_SECS";
pub const TRANSIENT_DIR: &str = "TRANSIENT_DIR";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

pub const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub transient_dir: PathBuf,
    pub connect_timeout: Duration,
    pub verbose: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transient_dir = lookup(TRANSIENT_DIR)
            .filter(|dir| !dir.trim().is_empty())
            .map_or_else(env::temp_dir, PathBuf::from);

        let connect_timeout = match lookup(DB_CONNECT_TIMEOUT_SECS) {
            Some(secs) => Duration::from_secs(
                secs.trim()
                    .parse()
                    .with_context(|| format!("Invalid {DB_CONNECT_TIMEOUT_SECS}: '{secs}'"))?,
            ),
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        let verbose = lookup(LOG_LEVEL).is_some_and(|level| level.trim().eq_ignore_ascii_case("debug"));

        Ok(Self {
            transient_dir,
            connect_timeout,
            verbose,
        })
    }
}
