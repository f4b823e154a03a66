use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Daemon settings, read from `FETCHD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub download_dir: PathBuf,
    pub default_throttle: u64,
    pub probe_addr: String,
    pub probe_interval: Duration,
    pub owner: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let default_throttle = var("FETCHD_DEFAULT_THROTTLE", "0")
            .parse()
            .context("FETCHD_DEFAULT_THROTTLE must be a byte count")?;
        let probe_interval_secs: u64 = var("FETCHD_PROBE_INTERVAL_SECS", "15")
            .parse()
            .context("FETCHD_PROBE_INTERVAL_SECS must be a number of seconds")?;

        Ok(Self {
            db_path: var("FETCHD_DB_PATH", "fetchd.db").into(),
            download_dir: var("FETCHD_DOWNLOAD_DIR", "./downloads").into(),
            default_throttle,
            probe_addr: var("FETCHD_PROBE_ADDR", "1.1.1.1:443"),
            probe_interval: Duration::from_secs(probe_interval_secs.max(1)),
            owner: var("FETCHD_OWNER", "fetchd-cli"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("fetchd.db"));
        assert_eq!(config.download_dir, PathBuf::from("./downloads"));
        assert_eq!(config.default_throttle, 0);
        assert_eq!(config.probe_addr, "1.1.1.1:443");
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.owner, "fetchd-cli");
    }

    #[test]
    fn variables_override_defaults() {
        let config = config(&[
            ("FETCHD_DB_PATH", "/var/lib/fetchd/catalog.db"),
            ("FETCHD_DEFAULT_THROTTLE", "65536"),
            ("FETCHD_PROBE_INTERVAL_SECS", "0"),
            ("FETCHD_OWNER", "updater"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/fetchd/catalog.db"));
        assert_eq!(config.default_throttle, 65536);
        assert_eq!(config.probe_interval, Duration::from_secs(1));
        assert_eq!(config.owner, "updater");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert!(config(&[("FETCHD_DEFAULT_THROTTLE", "fast")]).is_err());
        assert!(config(&[("FETCHD_PROBE_INTERVAL_SECS", "-3")]).is_err());
    }
}
