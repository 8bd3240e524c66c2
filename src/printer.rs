//! Print dispatch through the CUPS command-line tools.
//!
//! Submission runs `lp -d <printer> -o sides=<sides> <file>` once per file.
//! Completion is observed indirectly: `lpstat -o <printer>` is polled until
//! it prints nothing. That check cannot tell our jobs from anyone else's on
//! a shared printer, so a busy queue delays us until it is fully empty.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::PrinterConfig;
use crate::error::PrintError;
use crate::shutdown::Shutdown;
use crate::stager::StagedAttachment;

/// Upper bound for a single `lp` / `lpstat` invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Print subsystem seam.
#[async_trait]
pub trait Printer: Send + Sync {
    /// Queue one file on `printer`. Returns once the spooler accepted it.
    async fn submit(&self, printer: &str, file: &Path) -> Result<(), PrintError>;

    /// Whether the queue of `printer` still holds jobs.
    async fn has_pending_jobs(&self, printer: &str) -> Result<bool, PrintError>;
}

/// [`Printer`] backed by `lp` and `lpstat`.
#[derive(Debug, Clone)]
pub struct LpPrinter {
    sides: String,
}

impl LpPrinter {
    pub fn new(sides: impl Into<String>) -> Self {
        Self {
            sides: sides.into(),
        }
    }

    /// Arguments passed to `lp` for one file.
    pub fn submit_args(&self, printer: &str, file: &Path) -> Vec<String> {
        vec![
            "-d".to_string(),
            printer.to_string(),
            "-o".to_string(),
            format!("sides={}", self.sides),
            file.display().to_string(),
        ]
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<std::process::Output, String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("failed to run {program}: {e}")),
            Err(_) => Err(format!("{program} timed out after {COMMAND_TIMEOUT:?}")),
        }
    }
}

#[async_trait]
impl Printer for LpPrinter {
    async fn submit(&self, printer: &str, file: &Path) -> Result<(), PrintError> {
        let output = self
            .run("lp", &self.submit_args(printer, file))
            .await
            .map_err(|reason| PrintError::Spawn {
                printer: printer.to_string(),
                reason,
            })?;

        if !output.status.success() {
            return Err(PrintError::Rejected {
                printer: printer.to_string(),
                file: file.display().to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn has_pending_jobs(&self, printer: &str) -> Result<bool, PrintError> {
        let args = ["-o".to_string(), printer.to_string()];
        let output = self.run("lpstat", &args).await.map_err(PrintError::Status)?;
        if !output.status.success() {
            return Err(PrintError::Status(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(queue_busy(&output.stdout))
    }
}

/// `lpstat -o` lists one line per queued job and prints nothing otherwise.
fn queue_busy(stdout: &[u8]) -> bool {
    !stdout.iter().all(u8::is_ascii_whitespace)
}

/// Outcome of submitting a batch of files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub submitted: usize,
    pub failed: usize,
}

impl SubmissionReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Sends staged files to one named printer.
pub struct PrintDispatcher {
    printer: Arc<dyn Printer>,
    config: PrinterConfig,
}

impl PrintDispatcher {
    pub fn new(printer: Arc<dyn Printer>, config: PrinterConfig) -> Self {
        Self { printer, config }
    }

    pub fn printer_name(&self) -> &str {
        &self.config.name
    }

    /// Submit every file. A failed submission is logged and does not stop
    /// the remaining ones.
    pub async fn submit(&self, files: &[StagedAttachment]) -> SubmissionReport {
        let mut report = SubmissionReport::default();
        for file in files {
            info!(printer = %self.config.name, file = %file.path.display(), "Submitting print job");
            match self.printer.submit(&self.config.name, &file.path).await {
                Ok(()) => report.submitted += 1,
                Err(e) => {
                    error!(file = %file.path.display(), "Print submission failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Block until the printer queue reports no pending jobs.
    ///
    /// Waits `drain_settle_delay` first so the spooler has registered the
    /// new jobs, then polls every `drain_poll_interval`. Returns
    /// [`PrintError::Cancelled`] if shutdown is requested meanwhile.
    pub async fn await_queue_drain(&self, shutdown: &mut Shutdown) -> Result<(), PrintError> {
        if !shutdown.sleep(self.config.drain_settle_delay).await {
            return Err(PrintError::Cancelled);
        }
        while self.printer.has_pending_jobs(&self.config.name).await? {
            info!(printer = %self.config.name, "Waiting for job to complete");
            if !shutdown.sleep(self.config.drain_poll_interval).await {
                return Err(PrintError::Cancelled);
            }
        }
        Ok(())
    }
}
