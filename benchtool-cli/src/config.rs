//! Configuration for the benchtool binary.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `BENCH__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `BENCH__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `BENCH__WRITE__ENDPOINT=dns+distributor:8080` sets the remote-write endpoint
//! - `BENCH__QUERY__ENABLED=true` enables the query benchmark
//! - `BENCH__QUERY__ENDPOINT=query-frontend:8080` sets the query endpoint
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! write:
//!   endpoint: dns+distributor:8080
//!
//! query:
//!   enabled: true
//!   endpoint: query-frontend:8080
//! ```
//!
//! The workload itself lives in a separate file, see [`Config::workload_file`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use benchtool_engine::http::BasicAuth;
use benchtool_engine::ring::InstanceDesc;
use benchtool_engine::workload::WriteOptions;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BENCH__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// HTTP basic authentication credentials.
///
/// Used in: [`Write::basic_auth`], [`Query::basic_auth`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Credentials {
    pub username: String,

    /// # Environment Variable
    ///
    /// - `BENCH__WRITE__BASIC_AUTH__PASSWORD`
    /// - `BENCH__QUERY__BASIC_AUTH__PASSWORD`
    pub password: SecretBox<ConfigSecret>,
}

impl Credentials {
    /// Converts the credentials for use by the HTTP clients.
    pub fn to_basic_auth(&self) -> BasicAuth {
        BasicAuth::new(
            self.username.clone(),
            self.password.expose_secret().as_str(),
        )
    }
}

/// Configuration of the write benchmark.
///
/// `batch_size`, `send_interval` and `timeout` are defaults for the workload file. Values given
/// in the `write_options` section of the workload take precedence.
///
/// Used in: [`Config::write`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Write {
    /// Whether to run the write benchmark.
    ///
    /// # Default
    ///
    /// `true`
    pub enabled: bool,

    /// The remote-write endpoint.
    ///
    /// Either a `host:port` address or a discovery target such as `dns+<host>:<port>`,
    /// `dnssrv+<name>` or `dnssrvnoa+<name>`.
    ///
    /// # Environment Variable
    ///
    /// `BENCH__WRITE__ENDPOINT`
    pub endpoint: String,

    /// Tenant sent in the `X-Scope-OrgID` header.
    pub tenant_id: Option<String>,

    pub basic_auth: Option<Credentials>,

    /// Number of concurrent write workers.
    ///
    /// # Default
    ///
    /// `10`
    pub workers: usize,

    /// Maximum number of series per remote-write request.
    ///
    /// # Default
    ///
    /// `500`
    pub batch_size: usize,

    /// Interval between two generated sample batches.
    ///
    /// # Default
    ///
    /// `15s`
    #[serde(with = "humantime_serde")]
    pub send_interval: Duration,

    /// Timeout of a single remote-write request.
    ///
    /// # Default
    ///
    /// `15s`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Write {
    /// The write options used where the workload file leaves them unset.
    pub fn default_options(&self) -> WriteOptions {
        WriteOptions {
            interval: self.send_interval,
            timeout: self.timeout,
            batch_size: self.batch_size,
        }
    }
}

impl Default for Write {
    fn default() -> Self {
        let defaults = WriteOptions::default();
        Self {
            enabled: true,
            endpoint: String::new(),
            tenant_id: None,
            basic_auth: None,
            workers: 10,
            batch_size: defaults.batch_size,
            send_interval: defaults.interval,
            timeout: defaults.timeout,
        }
    }
}

/// Configuration of the query benchmark.
///
/// Used in: [`Config::query`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Query {
    /// Whether to run the query benchmark.
    ///
    /// # Default
    ///
    /// `false`
    pub enabled: bool,

    /// The query endpoint, in the same notation as [`Write::endpoint`].
    ///
    /// # Environment Variable
    ///
    /// `BENCH__QUERY__ENDPOINT`
    pub endpoint: String,

    /// Path under which the Prometheus query API is served.
    ///
    /// # Default
    ///
    /// `/prometheus`
    pub path_prefix: String,

    pub tenant_id: Option<String>,

    pub basic_auth: Option<Credentials>,

    /// Number of concurrent query workers.
    ///
    /// # Default
    ///
    /// `50`
    pub workers: usize,

    /// Timeout of a single query.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            path_prefix: "/prometheus".into(),
            tenant_id: None,
            basic_auth: None,
            workers: 50,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration of the ring cross-checker.
///
/// The checker predicts how the write workload is sharded over a static set of ring instances
/// and logs the number of series each instance should receive.
///
/// Used in: [`Config::ring_check`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RingCheck {
    /// # Default
    ///
    /// `false`
    pub enabled: bool,

    /// Interval between two reports.
    ///
    /// # Default
    ///
    /// `1m`
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Tenant the series are sharded for.
    ///
    /// # Default
    ///
    /// `fake`
    pub tenant_id: String,

    /// # Default
    ///
    /// `3`
    pub replication_factor: usize,

    /// Number of tokens generated for instances without explicit tokens.
    ///
    /// # Default
    ///
    /// `128`
    pub num_tokens: usize,

    /// The ring members.
    ///
    /// # Example
    ///
    /// ```yaml
    /// ring_check:
    ///   enabled: true
    ///   instances:
    ///     - addr: ingester-1:9095
    ///     - addr: ingester-2:9095
    ///       tokens: [1000, 2000000]
    /// ```
    pub instances: Vec<InstanceDesc>,
}

impl Default for RingCheck {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            tenant_id: "fake".into(),
            replication_factor: 3,
            num_tokens: 128,
            instances: Vec::new(),
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime.
    ///
    /// # Default
    ///
    /// Number of CPU cores on the host.
    ///
    /// # Environment Variable
    ///
    /// `BENCH__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// [Sentry](https://sentry.io/) error tracking configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided.
///
/// Used in: [`Config::sentry`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Environment Variable
    ///
    /// `BENCH__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    pub environment: Option<Cow<'static, str>>,

    pub server_name: Option<Cow<'static, str>>,

    /// # Default
    ///
    /// `1.0`
    pub sample_rate: f32,

    /// # Default
    ///
    /// `0.01`
    pub traces_sample_rate: f32,

    /// Enable Sentry SDK debug mode.
    pub debug: bool,

    /// Additional tags to attach to all Sentry events.
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// The format of log output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. `RUST_LOG` takes precedence over the configured level.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// # Default
    ///
    /// `info`
    ///
    /// # Environment Variable
    ///
    /// `BENCH__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// # Default
    ///
    /// `auto`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct of the benchtool binary.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Identity of the benchmark run, written to every series as the `bench_id` label.
    ///
    /// # Default
    ///
    /// The value of `$HOSTNAME`, or `benchtool` if unset.
    pub id: String,

    /// Address of the HTTP server exposing `/metrics` and `/health`.
    ///
    /// # Default
    ///
    /// `0.0.0.0:80`
    pub http_addr: SocketAddr,

    /// Path of the workload description file.
    ///
    /// # Default
    ///
    /// `./workload.yaml`
    pub workload_file: PathBuf,

    pub write: Write,

    pub query: Query,

    pub ring_check: RingCheck,

    pub runtime: Runtime,

    pub logging: Logging,

    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: std::env::var("HOSTNAME").unwrap_or_else(|_| "benchtool".into()),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            workload_file: PathBuf::from("./workload.yaml"),

            write: Write::default(),
            query: Query::default(),
            ring_check: RingCheck::default(),

            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that cannot be started with.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.runtime.worker_threads > 0,
            "runtime.worker_threads must be at least 1"
        );
        anyhow::ensure!(
            !self.ring_check.interval.is_zero(),
            "ring_check.interval must be greater than zero"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("HOSTNAME", "bench-7");

            let config = Config::load(None).unwrap();
            assert_eq!(config.id, "bench-7");
            assert_eq!(config.http_addr.port(), 80);
            assert_eq!(config.workload_file, Path::new("./workload.yaml"));

            assert!(config.write.enabled);
            assert_eq!(config.write.workers, 10);
            assert_eq!(config.write.default_options(), WriteOptions::default());

            assert!(!config.query.enabled);
            assert_eq!(config.query.path_prefix, "/prometheus");
            assert_eq!(config.query.workers, 50);
            assert_eq!(config.query.timeout, Duration::from_secs(60));

            assert!(!config.ring_check.enabled);
            assert_eq!(config.ring_check.tenant_id, "fake");
            assert_eq!(config.ring_check.replication_factor, 3);

            assert_eq!(config.logging.level, LevelFilter::INFO);
            assert!(!config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__ID", "run-42");
            jail.set_env("BENCH__WRITE__ENDPOINT", "dns+distributor:8080");
            jail.set_env("BENCH__WRITE__SEND_INTERVAL", "30s");
            jail.set_env("BENCH__WRITE__BASIC_AUTH__USERNAME", "bench");
            jail.set_env("BENCH__WRITE__BASIC_AUTH__PASSWORD", "hunter2");
            jail.set_env("BENCH__QUERY__ENABLED", "true");
            jail.set_env("BENCH__QUERY__TENANT_ID", "tenant-1");
            jail.set_env("BENCH__LOGGING__LEVEL", "debug");
            jail.set_env("BENCH__LOGGING__FORMAT", "json");
            jail.set_env("BENCH__SENTRY__DSN", "abcde");
            jail.set_env("BENCH__SENTRY__SAMPLE_RATE", "0.5");
            jail.set_env("BENCH__SENTRY__ENVIRONMENT", "production");

            let config = Config::load(None).unwrap();

            assert_eq!(config.id, "run-42");
            assert_eq!(config.write.endpoint, "dns+distributor:8080");
            assert_eq!(config.write.send_interval, Duration::from_secs(30));
            let auth = config.write.basic_auth.as_ref().unwrap();
            assert_eq!(auth.username, "bench");
            assert_eq!(auth.password.expose_secret().as_str(), "hunter2");

            assert!(config.query.enabled);
            assert_eq!(config.query.tenant_id.as_deref(), Some("tenant-1"));

            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.environment.as_deref(), Some("production"));
            assert_eq!(config.sentry.sample_rate, 0.5);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            http_addr: 127.0.0.1:9090
            workload_file: /etc/benchtool/workload.yaml
            write:
                endpoint: localhost:8080
                workers: 4
                batch_size: 100
            query:
                enabled: true
                endpoint: localhost:8081
                timeout: 5s
            ring_check:
                enabled: true
                replication_factor: 2
                instances:
                    - addr: ingester-1:9095
                    - addr: ingester-2:9095
                      tokens: [1, 2, 3]
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.http_addr, "127.0.0.1:9090".parse().unwrap());
            assert_eq!(
                config.workload_file,
                Path::new("/etc/benchtool/workload.yaml")
            );

            assert_eq!(config.write.endpoint, "localhost:8080");
            assert_eq!(config.write.workers, 4);
            assert_eq!(config.write.default_options().batch_size, 100);
            // Unset fields keep their defaults.
            assert_eq!(config.write.timeout, Duration::from_secs(15));

            assert!(config.query.enabled);
            assert_eq!(config.query.timeout, Duration::from_secs(5));
            assert_eq!(config.query.path_prefix, "/prometheus");

            assert!(config.ring_check.enabled);
            assert_eq!(config.ring_check.replication_factor, 2);
            assert_eq!(config.ring_check.instances.len(), 2);
            assert!(config.ring_check.instances[0].tokens.is_empty());
            assert_eq!(config.ring_check.instances[1].tokens, [1, 2, 3]);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            write:
                endpoint: localhost:8080
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__WRITE__ENDPOINT", "localhost:9009");

            let config = Config::load(Some(tempfile.path())).unwrap();
            // Env should overwrite the yaml config
            assert_eq!(config.write.endpoint, "localhost:9009");

            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__QUERY__BASIC_AUTH__USERNAME", "bench");
            jail.set_env("BENCH__QUERY__BASIC_AUTH__PASSWORD", "hunter2");
            jail.set_env("BENCH__SENTRY__DSN", "https://key@sentry.invalid/1");

            let config = Config::load(None).unwrap();
            let debug = format!("{config:?}");
            assert!(!debug.contains("hunter2"));
            assert!(!debug.contains("key@sentry"));

            Ok(())
        });
    }

    #[test]
    fn parses_log_formats() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__LOGGING__FORMAT", "json");
            let config = Config::load(None).unwrap();
            assert_eq!(config.logging.format, LogFormat::Json);

            jail.set_env("BENCH__LOGGING__FORMAT", "xml");
            assert!(Config::load(None).is_err());

            Ok(())
        });
    }

    #[test]
    fn rejects_zero_worker_threads() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__RUNTIME__WORKER_THREADS", "0");

            let error = Config::load(None).unwrap_err();
            assert!(error.to_string().contains("worker_threads"));

            Ok(())
        });
    }

    #[test]
    fn rejects_zero_ring_check_interval() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BENCH__RING_CHECK__INTERVAL", "0s");

            let error = Config::load(None).unwrap_err();
            assert!(error.to_string().contains("ring_check.interval"));

            Ok(())
        });
    }
}
