//! Integration tests for the poll loop.
//!
//! The mailbox and the printer are in-memory stubs; staging goes to a real
//! temporary directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::timeout;

use mail_print::config::{
    FilterCriteria, MailboxConfig, PrintConfig, PrinterConfig, StagingConfig,
};
use mail_print::error::{MailboxError, PrintError};
use mail_print::mailbox::{MailStore, MailboxSession, Uid, Watermark};
use mail_print::poll_loop::{LoopState, PollLoop};
use mail_print::printer::Printer;
use mail_print::shutdown::Shutdown;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Stub mailbox ────────────────────────────────────────────────────

#[derive(Default)]
struct MailboxState {
    /// UID to raw message.
    messages: BTreeMap<Uid, Vec<u8>>,
    /// UIDs returned by search; `None` means "every stored UID".
    search_override: Option<Vec<Uid>>,
    /// Remaining fetch failures per UID.
    fetch_failures: HashMap<Uid, usize>,
    /// Remaining connect failures.
    connect_failures: usize,
    fail_select: bool,
    queries: Vec<String>,
    connects: usize,
    disconnects: usize,
}

#[derive(Clone, Default)]
struct StubStore(Arc<Mutex<MailboxState>>);

impl StubStore {
    fn with<R>(&self, f: impl FnOnce(&mut MailboxState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn deliver(&self, uid: Uid, raw: Vec<u8>) {
        self.with(|s| s.messages.insert(uid, raw));
    }
}

#[async_trait]
impl MailStore for StubStore {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        self.with(|s| {
            if s.connect_failures > 0 {
                s.connect_failures -= 1;
                return Err(MailboxError::Auth {
                    reason: "[AUTHENTICATIONFAILED] Invalid credentials".into(),
                });
            }
            s.connects += 1;
            Ok(())
        })?;
        Ok(Box::new(StubSession {
            state: Arc::clone(&self.0),
            open: true,
        }))
    }
}

struct StubSession {
    state: Arc<Mutex<MailboxState>>,
    open: bool,
}

#[async_trait]
impl MailboxSession for StubSession {
    async fn select_folder(&mut self, name: &str) -> Result<(), MailboxError> {
        if self.state.lock().unwrap().fail_select {
            return Err(MailboxError::Folder {
                name: name.to_string(),
                reason: "Mailbox doesn't exist".into(),
            });
        }
        Ok(())
    }

    async fn search(&mut self, query: &str) -> Result<Vec<Uid>, MailboxError> {
        let mut s = self.state.lock().unwrap();
        s.queries.push(query.to_string());
        Ok(match &s.search_override {
            Some(uids) => uids.clone(),
            None => s.messages.keys().rev().copied().collect(),
        })
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
        let mut s = self.state.lock().unwrap();
        if let Some(left) = s.fetch_failures.get_mut(&uid) {
            if *left > 0 {
                *left -= 1;
                return Err(MailboxError::Fetch {
                    uid,
                    reason: "connection reset".into(),
                });
            }
        }
        s.messages.get(&uid).cloned().ok_or(MailboxError::Fetch {
            uid,
            reason: "no such message".into(),
        })
    }

    async fn disconnect(&mut self) {
        if self.open {
            self.open = false;
            self.state.lock().unwrap().disconnects += 1;
        }
    }
}

// ── Stub printer ────────────────────────────────────────────────────

#[derive(Default)]
struct StubPrinter {
    /// Contents of every submitted file, read at submission time.
    printed: Mutex<Vec<Vec<u8>>>,
    /// Payloads the printer refuses.
    reject: Mutex<Vec<Vec<u8>>>,
    /// Triggered on the first submission when set.
    cancel_on_submit: Mutex<Option<watch::Sender<bool>>>,
    /// Replace each submitted file with a non-empty directory so it cannot
    /// be removed with `remove_file`.
    pin_files: AtomicBool,
    /// Make every queue status query fail.
    status_broken: AtomicBool,
    submissions: AtomicUsize,
}

impl StubPrinter {
    fn printed(&self) -> Vec<Vec<u8>> {
        self.printed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Printer for StubPrinter {
    async fn submit(&self, printer: &str, file: &Path) -> Result<(), PrintError> {
        let contents = std::fs::read(file).map_err(|e| PrintError::Spawn {
            printer: printer.to_string(),
            reason: e.to_string(),
        })?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.pin_files.load(Ordering::SeqCst) {
            std::fs::remove_file(file).unwrap();
            std::fs::create_dir(file).unwrap();
            std::fs::write(file.join("spool.lock"), b"held").unwrap();
        }
        if let Some(tx) = self.cancel_on_submit.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        if self.reject.lock().unwrap().contains(&contents) {
            return Err(PrintError::Rejected {
                printer: printer.to_string(),
                file: file.display().to_string(),
                status: 1,
                stderr: "lp: Unable to print file".into(),
            });
        }
        self.printed.lock().unwrap().push(contents);
        Ok(())
    }

    async fn has_pending_jobs(&self, _printer: &str) -> Result<bool, PrintError> {
        if self.status_broken.load(Ordering::SeqCst) {
            return Err(PrintError::Status("lpstat timed out after 30s".into()));
        }
        Ok(false)
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn config(staging: &Path, keep_attachments: bool) -> PrintConfig {
    PrintConfig {
        mailbox: MailboxConfig {
            host: "imap.test.com".into(),
            port: 993,
            username: "printer@test.com".into(),
            password: SecretString::from("secret"),
            folder: "INBOX".into(),
        },
        filter: FilterCriteria::new([("FROM", "rossi@eurecom.fr"), ("SUBJECT", "print")]),
        printer: PrinterConfig {
            name: "tinee".into(),
            sides: "two-sided-long-edge".into(),
            drain_poll_interval: Duration::from_millis(1),
            drain_settle_delay: Duration::from_millis(1),
        },
        staging: StagingConfig {
            dir: staging.to_path_buf(),
            extension: "pdf".into(),
            keep_attachments,
        },
        poll_interval: Duration::from_millis(1),
        log_dir: None,
    }
}

/// A message carrying one `application/octet-stream` attachment per payload.
fn message(payloads: &[&str]) -> Vec<u8> {
    let mut raw = String::from(
        "From: rossi@eurecom.fr\r\n\
         Subject: print\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"b\"\r\n\
         \r\n\
         --b\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         see attached\r\n",
    );
    for payload in payloads {
        raw.push_str(
            "--b\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
             \r\n",
        );
        raw.push_str(payload);
        raw.push_str("\r\n");
    }
    raw.push_str("--b--\r\n");
    raw.into_bytes()
}

struct Harness {
    store: StubStore,
    printer: Arc<StubPrinter>,
    poll: PollLoop,
    staging: TempDir,
    cancel: watch::Sender<bool>,
}

fn harness(keep_attachments: bool) -> Harness {
    let staging = TempDir::new().unwrap();
    let store = StubStore::default();
    let printer = Arc::new(StubPrinter::default());
    let (cancel, shutdown) = Shutdown::channel();
    let poll = PollLoop::new(
        Arc::new(config(staging.path(), keep_attachments)),
        Arc::new(store.clone()),
        printer.clone(),
        shutdown,
    );
    Harness {
        store,
        printer,
        poll,
        staging,
        cancel,
    }
}

fn staged_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn first_cycle_sets_watermark_without_printing() {
    let mut h = harness(false);
    for uid in [5, 3, 7] {
        h.store.deliver(uid, message(&["old"]));
    }
    h.store.with(|s| s.search_override = Some(vec![5, 3, 7]));

    let report = h.poll.run_cycle().await.unwrap();

    assert!(report.initialized);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(7)));
    assert!(h.printer.printed().is_empty());
    assert_eq!(
        h.store.with(|s| s.queries.clone()),
        vec![r#"(FROM "rossi@eurecom.fr" SUBJECT "print" UID 1:*)"#]
    );
}

#[tokio::test]
async fn no_new_mail_leaves_watermark_unchanged() {
    let mut h = harness(false);
    h.store.deliver(7, message(&["old"]));
    h.poll.run_cycle().await.unwrap();

    // `UID 8:*` still reports the highest existing UID.
    let report = h.poll.run_cycle().await.unwrap();

    assert!(report.pending.is_empty());
    assert!(report.processed.is_empty());
    assert_eq!(report.watermark, Watermark::new(7));
    assert!(h.store.with(|s| s.queries[1].ends_with("UID 8:*)")));
    assert!(h.printer.printed().is_empty());
}

#[tokio::test]
async fn new_message_is_printed_and_cleaned_up() {
    let mut h = harness(false);
    h.store.deliver(7, message(&["old"]));
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(8, message(&["%PDF-new"]));
    let report = h.poll.run_cycle().await.unwrap();

    assert_eq!(report.processed, vec![8]);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(8)));
    assert_eq!(h.printer.printed(), vec![b"%PDF-new".to_vec()]);
    assert!(staged_files(h.staging.path()).is_empty());
    assert_eq!(h.poll.state(), LoopState::Disconnected);
}

#[tokio::test]
async fn messages_are_processed_in_ascending_order() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();
    assert_eq!(h.poll.watermark(), Some(Watermark::new(0)));

    h.store.deliver(12, message(&["twelve"]));
    h.store.deliver(10, message(&["ten-a", "ten-b"]));
    h.store.deliver(11, message(&["eleven"]));
    h.store.with(|s| s.search_override = Some(vec![12, 10, 11]));

    let report = h.poll.run_cycle().await.unwrap();

    assert_eq!(report.processed, vec![10, 11, 12]);
    assert_eq!(
        h.printer.printed(),
        vec![
            b"ten-a".to_vec(),
            b"ten-b".to_vec(),
            b"eleven".to_vec(),
            b"twelve".to_vec()
        ]
    );
    assert_eq!(h.poll.watermark(), Some(Watermark::new(12)));
}

#[tokio::test]
async fn search_results_at_or_below_watermark_are_ignored() {
    let mut h = harness(false);
    h.store.deliver(7, message(&["old"]));
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(9, message(&["new"]));
    h.store.with(|s| s.search_override = Some(vec![2, 7, 9, 5]));
    let report = h.poll.run_cycle().await.unwrap();

    assert_eq!(report.pending, vec![9]);
    assert_eq!(h.printer.printed(), vec![b"new".to_vec()]);
}

#[tokio::test]
async fn failed_fetch_is_retried_next_cycle() {
    let mut h = harness(false);
    h.store.deliver(8, message(&["old"]));
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(9, message(&["nine"]));
    h.store.with(|s| s.fetch_failures.insert(9, 1));

    let first = h.poll.run_cycle().await.unwrap();
    assert_eq!(first.failed, Some(9));
    assert!(h.poll.watermark().unwrap() < Watermark::new(9));
    assert!(h.printer.printed().is_empty());

    let second = h.poll.run_cycle().await.unwrap();
    assert!(second.pending.contains(&9));
    assert_eq!(second.processed, vec![9]);
    assert!(h.poll.watermark().unwrap() >= Watermark::new(9));
    assert_eq!(h.printer.printed(), vec![b"nine".to_vec()]);
}

#[tokio::test]
async fn failure_stops_the_cycle_and_keeps_later_uids() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(3, message(&["three"]));
    h.store.deliver(4, message(&["four"]));
    h.store.deliver(5, message(&["five"]));
    h.store.with(|s| s.fetch_failures.insert(4, 1));

    let report = h.poll.run_cycle().await.unwrap();
    assert_eq!(report.processed, vec![3]);
    assert_eq!(report.failed, Some(4));
    assert_eq!(h.poll.watermark(), Some(Watermark::new(3)));

    let report = h.poll.run_cycle().await.unwrap();
    assert_eq!(report.processed, vec![4, 5]);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(5)));
}

#[tokio::test]
async fn rejected_print_is_retried_and_files_cleaned() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(1, message(&["jammed", "fine"]));
    h.printer.reject.lock().unwrap().push(b"jammed".to_vec());

    let report = h.poll.run_cycle().await.unwrap();
    assert_eq!(report.failed, Some(1));
    assert_eq!(h.poll.watermark(), Some(Watermark::new(0)));
    // The other file was still submitted.
    assert_eq!(h.printer.printed(), vec![b"fine".to_vec()]);
    assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn broken_queue_status_does_not_reprint() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(1, message(&["once"]));
    h.printer.status_broken.store(true, Ordering::SeqCst);

    let report = h.poll.run_cycle().await.unwrap();
    assert_eq!(report.processed, vec![1]);
    assert_eq!(report.failed, None);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(1)));

    for _ in 0..2 {
        let report = h.poll.run_cycle().await.unwrap();
        assert!(report.pending.is_empty());
    }
    assert_eq!(h.printer.submissions.load(Ordering::SeqCst), 1);
    assert!(staged_files(h.staging.path()).is_empty());
}

#[tokio::test]
async fn cleanup_failure_after_print_still_advances_watermark() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(1, message(&["printed"]));
    h.printer.pin_files.store(true, Ordering::SeqCst);

    let report = h.poll.run_cycle().await.unwrap();

    assert_eq!(report.processed, vec![1]);
    assert_eq!(report.failed, None);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(1)));
    assert_eq!(h.printer.printed(), vec![b"printed".to_vec()]);
    // The leftover could not be removed.
    assert_eq!(
        staged_files(h.staging.path()),
        vec![h.staging.path().join("attach-00.pdf")]
    );
}

#[tokio::test]
async fn message_without_attachments_advances_watermark() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(
        1,
        b"From: rossi@eurecom.fr\r\nSubject: print\r\n\r\nnothing attached\r\n".to_vec(),
    );
    let report = h.poll.run_cycle().await.unwrap();

    assert_eq!(report.processed, vec![1]);
    assert_eq!(h.poll.watermark(), Some(Watermark::new(1)));
    assert!(h.printer.printed().is_empty());
}

#[tokio::test]
async fn retention_keeps_staged_files() {
    let mut h = harness(true);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(1, message(&["keep-me"]));
    h.poll.run_cycle().await.unwrap();

    let files = staged_files(h.staging.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("attach-00.pdf"));
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"keep-me");
}

#[tokio::test]
async fn auth_failure_is_retried_next_cycle() {
    let mut h = harness(false);
    h.store.with(|s| s.connect_failures = 1);

    let err = h.poll.run_cycle().await.unwrap_err();
    assert!(matches!(err, MailboxError::Auth { .. }));
    assert_eq!(h.poll.watermark(), None);

    h.poll.run_cycle().await.unwrap();
    assert_eq!(h.poll.watermark(), Some(Watermark::new(0)));
    h.store.with(|s| assert_eq!(s.connects, s.disconnects));
}

#[tokio::test]
async fn every_connect_is_paired_with_a_disconnect() {
    let mut h = harness(false);
    h.store.with(|s| s.fail_select = true);

    let err = h.poll.run_cycle().await.unwrap_err();
    assert!(matches!(err, MailboxError::Folder { .. }));

    h.store.with(|s| s.fail_select = false);
    h.poll.run_cycle().await.unwrap();
    h.store.deliver(1, message(&["doc"]));
    h.poll.run_cycle().await.unwrap();

    h.store.with(|s| {
        assert_eq!(s.connects, 3);
        assert_eq!(s.disconnects, 3);
    });
}

#[tokio::test]
async fn run_forever_stops_before_connecting_when_cancelled() {
    let mut h = harness(false);
    h.cancel.send(true).unwrap();

    timeout(TEST_TIMEOUT, h.poll.run_forever()).await.unwrap();

    assert_eq!(h.poll.state(), LoopState::Stopped);
    assert_eq!(h.store.with(|s| s.connects), 0);
}

#[tokio::test]
async fn cancellation_during_drain_finishes_the_cycle() {
    let mut h = harness(false);
    h.poll.run_cycle().await.unwrap();

    h.store.deliver(1, message(&["last"]));
    *h.printer.cancel_on_submit.lock().unwrap() = Some(h.cancel);

    timeout(TEST_TIMEOUT, h.poll.run_forever()).await.unwrap();

    assert_eq!(h.poll.state(), LoopState::Stopped);
    assert_eq!(h.printer.printed(), vec![b"last".to_vec()]);
    // The drain wait was interrupted, so the message stays eligible.
    assert_eq!(h.poll.watermark(), Some(Watermark::new(0)));
    assert!(staged_files(h.staging.path()).is_empty());
    h.store.with(|s| assert_eq!(s.connects, s.disconnects));
}
