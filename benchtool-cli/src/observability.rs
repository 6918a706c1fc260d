use std::env;
use std::io::IsTerminal;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::{Config, LogFormat};

/// The default filter directives, before the configured level is applied.
const DEFAULT_DIRECTIVES: &str = "INFO,\
    hickory_proto=WARN,\
    hickory_resolver=WARN,\
    benchtool=TRACE,\
    benchtool_cli=TRACE,\
    benchtool_engine=TRACE,\
    ";

pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let sentry_config = &config.sentry;
    let dsn = sentry_config.dsn.as_ref()?;

    let guard = sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        release: sentry::release_name!(),
        environment: sentry_config.environment.clone(),
        server_name: sentry_config.server_name.clone(),
        sample_rate: sentry_config.sample_rate,
        traces_sample_rate: sentry_config.traces_sample_rate,
        debug: sentry_config.debug,
        enable_logs: true,
        ..Default::default()
    });

    sentry::configure_scope(|scope| {
        scope.set_tag("bench_id", &config.id);
        for (key, value) in &sentry_config.tags {
            scope.set_tag(key, value);
        }
    });

    Some(guard)
}

pub fn init_tracing(config: &Config) {
    // Same as the default filter, except it converts warnings into events
    // and also sends everything at or above INFO as logs instead of breadcrumbs.
    let sentry_layer = config.sentry.is_enabled().then(|| {
        sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
            Level::ERROR | Level::WARN => {
                sentry_tracing::EventFilter::Event | sentry_tracing::EventFilter::Log
            }
            Level::INFO => sentry_tracing::EventFilter::Log,
            Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
        })
    });

    let (level, env_filter) = parse_rust_log(config.logging.level);

    tracing_subscriber::registry()
        .with(format_layer(config.logging.format).with_filter(level))
        .with(sentry_layer)
        .with(env_filter)
        .init();
}

fn format_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let format = match format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
        LogFormat::Simplified | LogFormat::Auto => layer.compact().with_ansi(false).boxed(),
    }
}

/// Returns the effective log level and the filter directives.
///
/// `RUST_LOG` overrides the configured level if it is a plain level. Otherwise, it is used
/// literally as filter directives.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    (level, EnvFilter::new(DEFAULT_DIRECTIVES))
}
