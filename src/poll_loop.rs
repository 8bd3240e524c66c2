//! The polling orchestrator.
//!
//! One cycle: connect, select the folder, search above the watermark, then
//! for each new UID in ascending order fetch, decode, stage, print, wait for
//! the queue to drain and clean up. The session is always closed before the
//! cycle ends, whatever happened in between.
//!
//! The watermark only moves after a message went through the whole
//! pipeline. The first failure ends the processing phase, so the failed UID
//! and everything after it are searched again next cycle. A document may be
//! printed twice this way; it is never silently skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::PrintConfig;
use crate::decoder;
use crate::error::{Error, MailboxError, PrintError};
use crate::mailbox::{MailStore, MailboxSession, Uid, Watermark, search_query};
use crate::printer::{PrintDispatcher, Printer};
use crate::shutdown::Shutdown;
use crate::stager::{AttachmentStager, RetentionPolicy, StagedAttachment};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Connected,
    Searching,
    Processing,
    Disconnected,
    Waiting,
    Stopped,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// This cycle only established the initial watermark.
    pub initialized: bool,
    /// UIDs above the watermark, ascending.
    pub pending: Vec<Uid>,
    /// UIDs whose pipeline completed.
    pub processed: Vec<Uid>,
    /// UID whose pipeline failed, ending the processing phase.
    pub failed: Option<Uid>,
    /// Watermark at the end of the cycle.
    pub watermark: Watermark,
}

pub struct PollLoop {
    config: Arc<PrintConfig>,
    store: Arc<dyn MailStore>,
    stager: AttachmentStager,
    dispatcher: PrintDispatcher,
    shutdown: Shutdown,
    watermark: Option<Watermark>,
    state: LoopState,
}

impl PollLoop {
    pub fn new(
        config: Arc<PrintConfig>,
        store: Arc<dyn MailStore>,
        printer: Arc<dyn Printer>,
        shutdown: Shutdown,
    ) -> Self {
        let stager = AttachmentStager::from_config(&config.staging);
        let dispatcher = PrintDispatcher::new(printer, config.printer.clone());
        Self {
            config,
            store,
            stager,
            dispatcher,
            shutdown,
            watermark: None,
            state: LoopState::Idle,
        }
    }

    /// `None` until the first successful search.
    pub fn watermark(&self) -> Option<Watermark> {
        self.watermark
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Poll until cancelled.
    ///
    /// Cycle failures are logged and retried after the regular interval.
    /// Cancellation lets the running cycle finish, disconnect included.
    pub async fn run_forever(&mut self) {
        info!(
            printer = %self.dispatcher.printer_name(),
            host = %self.config.mailbox.host,
            interval = ?self.config.poll_interval,
            "Mail print agent started"
        );

        while !self.shutdown.is_triggered() {
            match self.run_cycle().await {
                Ok(report) if report.initialized => {
                    info!(watermark = %report.watermark, "Ignoring mail at or below watermark");
                }
                Ok(report) => {
                    debug!(
                        started_at = %report.started_at.to_rfc3339(),
                        processed = report.processed.len(),
                        watermark = %report.watermark,
                        "Poll cycle done"
                    );
                }
                Err(e) => warn!("Poll cycle failed, retrying next cycle: {e}"),
            }

            self.transition(LoopState::Waiting);
            if !self.shutdown.sleep(self.config.poll_interval).await {
                break;
            }
        }

        self.transition(LoopState::Stopped);
        info!("Mail print agent stopped");
    }

    /// Run one connect-to-disconnect cycle.
    ///
    /// The first successful cycle only sets the watermark to the highest
    /// UID currently matching the filter, so old mail is never printed.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, MailboxError> {
        let started_at = Utc::now();
        let mut session = self.store.connect().await?;
        self.transition(LoopState::Connected);

        let result = self.cycle_body(session.as_mut(), started_at).await;

        session.disconnect().await;
        self.transition(LoopState::Disconnected);
        result
    }

    async fn cycle_body(
        &mut self,
        session: &mut dyn MailboxSession,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport, MailboxError> {
        session.select_folder(&self.config.mailbox.folder).await?;

        self.transition(LoopState::Searching);
        let current = self.watermark.unwrap_or_default();
        let query = search_query(&self.config.filter, current);
        debug!(query = %query, "Searching mailbox");
        let found = session.search(&query).await?;

        let mut report = CycleReport {
            started_at,
            initialized: false,
            pending: Vec::new(),
            processed: Vec::new(),
            failed: None,
            watermark: current,
        };

        let Some(mut watermark) = self.watermark else {
            let initial = Watermark::new(found.iter().copied().max().unwrap_or(0));
            self.watermark = Some(initial);
            report.initialized = true;
            report.watermark = initial;
            return Ok(report);
        };

        report.pending = pending_uids(found, watermark);
        if report.pending.is_empty() {
            return Ok(report);
        }

        info!(
            "{} new messages (UIDs = {})",
            report.pending.len(),
            report
                .pending
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.transition(LoopState::Processing);
        for &uid in &report.pending {
            match self.process_message(session, uid).await {
                Ok(()) => {
                    watermark.advance(uid);
                    self.watermark = Some(watermark);
                    report.processed.push(uid);
                }
                Err(e) => {
                    error!(uid, "Processing failed, will retry next cycle: {e}");
                    report.failed = Some(uid);
                    break;
                }
            }
        }

        report.watermark = watermark;
        Ok(report)
    }

    /// Fetch, decode, stage, print and clean up one message.
    async fn process_message(
        &mut self,
        session: &mut dyn MailboxSession,
        uid: Uid,
    ) -> crate::error::Result<()> {
        info!(uid, "Processing email");
        let raw = session.fetch(uid).await?;
        let attachments = decoder::extract_attachments(&raw)?;
        if attachments.is_empty() {
            info!(uid, "No binary attachments to print");
            return Ok(());
        }

        let staged = self.stager.stage(&attachments).await?;
        let printed = self.print(&staged).await;

        match self.stager.retention() {
            RetentionPolicy::Delete => {
                // Printing decides success; a leftover file does not.
                if let Err(e) = self.stager.cleanup(&staged).await {
                    warn!(uid, "Staged file cleanup failed: {e}");
                }
            }
            RetentionPolicy::Keep => {
                debug!(uid, dir = %self.stager.dir().display(), "Keeping staged attachments");
            }
        }

        printed.map_err(Error::from)
    }

    /// Submission decides success. The queue drain only paces the loop, so
    /// a broken status query is logged and treated as drained; shutdown
    /// during the wait still fails the message.
    async fn print(&mut self, staged: &[StagedAttachment]) -> Result<(), PrintError> {
        let report = self.dispatcher.submit(staged).await;
        if report.submitted > 0 {
            match self.dispatcher.await_queue_drain(&mut self.shutdown).await {
                Ok(()) => {}
                Err(PrintError::Cancelled) => return Err(PrintError::Cancelled),
                Err(e) => warn!(
                    printer = %self.dispatcher.printer_name(),
                    "Queue status unavailable, assuming drained: {e}"
                ),
            }
        }
        if !report.is_complete() {
            return Err(PrintError::PartialSubmission {
                failed: report.failed,
                total: staged.len(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = ?self.state, to = ?next, "Loop state");
        self.state = next;
    }
}

/// Search results strictly above `watermark`, ascending and deduplicated.
///
/// `UID n:*` always matches the highest UID in the folder even when it is
/// below `n`, so the range constraint cannot be trusted on its own.
pub fn pending_uids(found: Vec<Uid>, watermark: Watermark) -> Vec<Uid> {
    let mut uids: Vec<Uid> = found.into_iter().filter(|&u| watermark.admits(u)).collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}
