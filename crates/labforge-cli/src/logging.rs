//! Tracing setup: console output plus one timestamped log file per run.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the console layer and, when the log directory is writable,
/// a per-run file layer. The returned guard must stay alive for the
/// process lifetime or buffered file output is lost.
pub fn init(log_dir: &str, verbose: bool, trace: bool) -> Option<WorkerGuard> {
    let default_level = if trace {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("LABFORGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    let file_layer = std::fs::create_dir_all(log_dir).ok().map(|()| {
        let file_name = format!(
            "labforge-{}.log",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );
        let appender = tracing_appender::rolling::never(log_dir, file_name);
        tracing_appender::non_blocking(appender)
    });

    match file_layer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_target(false)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            eprintln!("warning: log directory '{log_dir}' is not writable, logging to console only");
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .init();
            None
        }
    }
}
