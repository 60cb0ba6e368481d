use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Overrides `--log-level` with a full filter directive when set.
pub const LOG_ENV: &str = "IPCBRIDGE_LOG";

const CRATES: [&str; 5] = [
    "ipcbridge",
    "ipcbridge_wire",
    "ipcbridge_transport",
    "ipcbridge_export",
    "ipcbridge_import",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `level` for the ipcbridge crates, never chattier than `warn` for the rest.
fn default_directive(level: LogLevel) -> String {
    let level = level.as_filter();
    let others = level.min(LevelFilter::WARN);
    let mut directive = others.to_string().to_lowercase();
    for krate in CRATES {
        directive.push_str(&format!(",{krate}={}", level.to_string().to_lowercase()));
    }
    directive
}

/// Install the stderr subscriber. Protocol flow from the library crates is
/// logged at `debug`, suppressed sends and diagnostics at `warn`.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        eprintln!("warning: a tracing subscriber is already installed");
    }
}
