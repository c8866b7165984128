use std::path::PathBuf;

use chrono_tz::Tz;

/// Certificate and key for the optional TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once at startup from `NEVERMISS_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Zone for pages created without an explicit `timezone`.
    pub default_timezone: Tz,
    pub tls: Option<TlsFiles>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigLoadError {
    Invalid { var: &'static str, value: String },
    TlsIncomplete,
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Invalid { var, value } => write!(f, "invalid {var}: '{value}'"),
            ConfigLoadError::TlsIncomplete => write!(
                f,
                "both NEVERMISS_TLS_CERT and NEVERMISS_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigLoadError> {
        let tls = match (get("NEVERMISS_TLS_CERT"), get("NEVERMISS_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigLoadError::TlsIncomplete),
        };

        let password = get("NEVERMISS_PASSWORD").unwrap_or_else(|| "nevermiss".into());
        if password.is_empty() {
            return Err(ConfigLoadError::Invalid {
                var: "NEVERMISS_PASSWORD",
                value: password,
            });
        }

        Ok(Self {
            bind: get("NEVERMISS_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "NEVERMISS_PORT")?.unwrap_or(5433),
            data_dir: get("NEVERMISS_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password,
            max_connections: parsed(&get, "NEVERMISS_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "NEVERMISS_COMPACT_THRESHOLD")?.unwrap_or(1000),
            default_timezone: parsed(&get, "NEVERMISS_TIMEZONE")?.unwrap_or(chrono_tz::UTC),
            tls,
            metrics_port: parsed(&get, "NEVERMISS_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Unset is `None`; set but unparsable is an error rather than a silent default.
fn parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigLoadError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::Invalid { var, value }),
    }
}
