pub mod clean;
pub mod cloud;
pub mod config;
pub mod epub;
pub mod error;
pub mod fetch;
pub mod index;
pub mod orchestrate;
pub mod parsing;
pub mod pool;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod slug;
pub mod workspace;

use std::sync::LazyLock;

use indicatif::MultiProgress;

/// Shared progress-bar surface every long-running command renders into, so the archive run's
/// per-chapter bars and the CLI's top-level status line never fight over stdout.
pub static MULTI_PROGRESS: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Initializes the `tracing` subscriber: a rotating file layer under `workspace/logs/` carrying
/// full verbosity, matching `SPEC_FULL.md` §6. Returns the guard that must be held for the
/// lifetime of the process, or the file layer drops buffered writes on drop.
pub fn init_logging(workspace_root: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let logs_dir = workspace_root.join("logs");
    let _ = std::fs::create_dir_all(&logs_dir);

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "archiver.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    guard
}
