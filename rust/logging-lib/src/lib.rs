use std::sync::Once;

use clap::{Parser, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
pub struct LoggingOpts {
    #[clap(long, env = "EP_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "EP_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Additional level directives in the RUST_LOG format, applied per target.
    /// RUST_LOG takes priority when both set a level for the same target.
    #[clap(long, env = "EP_LOG_DIRECTIVES")]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_color: LogColor::Auto,
            log_directives: None,
        }
    }
}

fn env_filter(directives: Option<&str>) -> Result<EnvFilter, anyhow::Error> {
    let mut builder = EnvFilter::builder();
    if let Some(directives) = directives {
        builder = builder.with_default_directive(directives.parse()?);
    }
    Ok(builder.from_env_lossy())
}

pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        // tracing_subscriber::fmt writes to stderr below.
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(opts.log_directives.as_deref())?)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    dispatcher::set_global_default(dispatch)?;

    tracing_log::LogTracer::builder()
        // Must run after the global default is set to pick up its max level.
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

/// Route logs through the libtest capture. Safe to call from every test.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = env_filter(Some("warn")).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}
