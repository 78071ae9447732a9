//! Process configuration, read once from `SPOTLEDGER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8080/spot-images";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("SPOTLEDGER_{name}")).filter(|v| !v.trim().is_empty());
        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".into()));

        Self {
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "PORT").unwrap_or(5433),
            password: var("PASSWORD").unwrap_or_else(|| "spotledger".into()),
            max_connections: parsed(&var, "MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&var, "COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&var, "METRICS_PORT"),
            tls_cert: var("TLS_CERT").map(PathBuf::from),
            tls_key: var("TLS_KEY").map(PathBuf::from),
            upload_dir: var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("uploads")),
            public_base_url: var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            data_dir,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring SPOTLEDGER_{name}={raw:?}: not a valid number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.password, "spotledger");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.tls_cert, None);
        assert_eq!(config.upload_dir, PathBuf::from("./data/uploads"));
        assert_eq!(config.public_base_url, DEFAULT_PUBLIC_BASE_URL);
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            ("SPOTLEDGER_BIND", "127.0.0.1"),
            ("SPOTLEDGER_PORT", "6543"),
            ("SPOTLEDGER_DATA_DIR", "/var/lib/spotledger"),
            ("SPOTLEDGER_METRICS_PORT", "9090"),
            ("SPOTLEDGER_COMPACT_THRESHOLD", " 50 "),
            ("SPOTLEDGER_PUBLIC_BASE_URL", "https://cdn.example.com/spots/"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.upload_dir, PathBuf::from("/var/lib/spotledger/uploads"));
        assert_eq!(config.public_base_url, "https://cdn.example.com/spots");
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = config_from(&[
            ("SPOTLEDGER_PORT", "not-a-port"),
            ("SPOTLEDGER_MAX_CONNECTIONS", "-4"),
            ("SPOTLEDGER_METRICS_PORT", "70000"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("SPOTLEDGER_TLS_CERT", ""), ("SPOTLEDGER_UPLOAD_DIR", "  ")]);
        assert_eq!(config.tls_cert, None);
        assert_eq!(config.upload_dir, PathBuf::from("./data/uploads"));
    }
}
