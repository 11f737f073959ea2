use clap::ArgMatches;
use std::borrow::Borrow;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoggingStyle {
    /// Uses compact logging.
    Compact,
    /// Uses JSON formatted logging
    Json,
}

/// Initializes the tracing and logging system from arguments.
///
/// The output style is taken from `--log` (or `APP_LOG_STYLE`) and falls
/// back to compact output if it is absent.
///
/// ## Arguments
/// * `matches` - The clap argument matches.
pub fn initialize_from_matches<M: Borrow<ArgMatches>>(matches: M) {
    let style = matches
        .borrow()
        .get_one::<LoggingStyle>("logging_style")
        .copied()
        .unwrap_or(LoggingStyle::Compact);
    initialize(style)
}

/// Initializes the tracing and logging system.
///
/// Events at `INFO` and above are emitted unless the `RUST_LOG` environment
/// variable says otherwise, e.g. `RUST_LOG=stitchery=debug` to see every stored chunk.
///
/// ## Arguments
/// * `style` - The logging style to use.
pub fn initialize<S: Borrow<LoggingStyle>>(style: S) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let formatter = tracing_subscriber::fmt()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(true)
        .with_target(true)
        .with_env_filter(filter);

    match style.borrow() {
        LoggingStyle::Compact => formatter.init(),
        LoggingStyle::Json => formatter.json().init(),
    }
}
