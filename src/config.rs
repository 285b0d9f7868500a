use crate::polling::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, PollConfig};
use anyhow::{Context, Result, ensure};
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// UI server configuration
    pub ui: UiConfig,

    /// Backend REST API configuration
    pub backend: BackendConfig,

    /// Polling cadence of the long-running setup steps
    pub setup: SetupConfig,

    /// TLS certificate configuration, plain HTTP when absent
    pub certificate: Option<CertificateConfig>,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
    pub cors_origin: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
    pub token: Option<String>,
    /// Upper bound for a single backend round-trip
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct SetupConfig {
    pub poll: PollConfig,
}

#[derive(Clone, Debug)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            ui: UiConfig::load()?,
            backend: BackendConfig::load()?,
            setup: SetupConfig::load()?,
            certificate: CertificateConfig::load()?,
        })
    }
}

impl UiConfig {
    fn load() -> Result<Self> {
        let port = env::var("UI_PORT")
            .unwrap_or_else(|_| "1977".to_string())
            .parse::<u16>()
            .context("failed to parse UI_PORT: invalid format")?;

        let cors_origin = env::var("CORS_ORIGIN").ok().filter(|o| !o.is_empty());

        Ok(Self { port, cors_origin })
    }
}

impl BackendConfig {
    fn load() -> Result<Self> {
        let url = env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "failed to parse BACKEND_URL: expected http(s) url but got {url}"
        );

        let token = env::var("BACKEND_TOKEN").ok().filter(|t| !t.is_empty());

        let request_timeout =
            secs_from_env("BACKEND_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT)?;
        ensure!(
            !request_timeout.is_zero(),
            "failed to parse BACKEND_REQUEST_TIMEOUT_SECS: must be greater than 0"
        );

        Ok(Self {
            url,
            token,
            request_timeout,
        })
    }
}

impl SetupConfig {
    fn load() -> Result<Self> {
        let interval = secs_from_env("SETUP_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?;
        let timeout = secs_from_env("SETUP_POLL_TIMEOUT_SECS", DEFAULT_POLL_TIMEOUT)?;

        ensure!(
            !interval.is_zero(),
            "failed to parse SETUP_POLL_INTERVAL_SECS: must be greater than 0"
        );
        ensure!(
            timeout >= interval,
            "SETUP_POLL_TIMEOUT_SECS must not be shorter than SETUP_POLL_INTERVAL_SECS"
        );

        Ok(Self {
            poll: PollConfig { interval, timeout },
        })
    }
}

impl CertificateConfig {
    fn load() -> Result<Option<Self>> {
        match (env::var("CERT_PATH"), env::var("KEY_PATH")) {
            (Ok(cert_path), Ok(key_path)) => Ok(Some(Self {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            })),
            (Err(_), Err(_)) => Ok(None),
            _ => anyhow::bail!("CERT_PATH and KEY_PATH must be set together"),
        }
    }
}

fn secs_from_env(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_seconds_fall_back_to_default() {
        let value = secs_from_env("SENSOR_KIT_SETUP_TEST_UNSET", Duration::from_secs(7)).unwrap();
        assert_eq!(value, Duration::from_secs(7));
    }

    #[test]
    fn seconds_are_parsed() {
        // SAFETY: the variable is unique to this test
        unsafe { env::set_var("SENSOR_KIT_SETUP_TEST_SECS", "30") };
        let value = secs_from_env("SENSOR_KIT_SETUP_TEST_SECS", DEFAULT_POLL_INTERVAL).unwrap();
        assert_eq!(value, Duration::from_secs(30));
    }

    #[test]
    fn malformed_seconds_are_rejected() {
        // SAFETY: the variable is unique to this test
        unsafe { env::set_var("SENSOR_KIT_SETUP_TEST_BAD_SECS", "five") };
        let error = secs_from_env("SENSOR_KIT_SETUP_TEST_BAD_SECS", DEFAULT_POLL_INTERVAL)
            .unwrap_err();
        assert!(error.to_string().contains("SENSOR_KIT_SETUP_TEST_BAD_SECS"));
    }
}
