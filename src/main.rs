use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use mail_print::config::PrintConfig;
use mail_print::mailbox::ImapStore;
use mail_print::poll_loop::PollLoop;
use mail_print::printer::LpPrinter;
use mail_print::shutdown;

/// Rolled log files kept on disk.
const MAX_LOG_FILES: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let printer = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MAILPRINT_PRINTER").ok())
        .unwrap_or_else(|| {
            eprintln!("Usage: mail-print <printer>");
            eprintln!("  (or set MAILPRINT_PRINTER)");
            std::process::exit(2);
        });

    let config = Arc::new(PrintConfig::from_env(&printer).context("Invalid configuration")?);
    let _log_guard = init_tracing(&config)?;

    eprintln!("mail-print v{}", env!("CARGO_PKG_VERSION"));
    info!(
        printer = %config.printer.name,
        filter = %config.filter,
        folder = %config.mailbox.folder,
        keep_attachments = config.staging.keep_attachments,
        "Configuration loaded"
    );

    let store = Arc::new(ImapStore::new(config.mailbox.clone()).context("TLS setup failed")?);
    let lp = Arc::new(LpPrinter::new(config.printer.sides.clone()));
    let shutdown = shutdown::watch_signals();

    let mut poll_loop = PollLoop::new(Arc::clone(&config), store, lp, shutdown);
    poll_loop.run_forever().await;
    Ok(())
}

/// Stdout plus an hourly rolling file per printer.
fn init_tracing(config: &PrintConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
            let appender = rolling::Builder::new()
                .rotation(Rotation::HOURLY)
                .filename_prefix(format!("mail-print-{}", config.printer.name))
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(dir)
                .context("Cannot open rolling log file")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(guard)
}
