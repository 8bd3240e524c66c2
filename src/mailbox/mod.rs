//! Mailbox store access: search query construction and the session seam.
//!
//! The poll loop only talks to [`MailStore`] / [`MailboxSession`]; the IMAP
//! implementation lives in [`imap`]. A session covers exactly one cycle:
//! connect, select, search, some fetches, disconnect.

pub mod imap;
pub mod query;

use std::fmt;

use async_trait::async_trait;

use crate::error::MailboxError;

pub use imap::ImapStore;
pub use query::search_query;

/// Store-assigned message identifier.
pub type Uid = u32;

/// Highest message UID whose pipeline fully completed.
///
/// Never decreases. Any UID at or below the watermark is never processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(Uid);

impl Watermark {
    pub const fn new(uid: Uid) -> Self {
        Self(uid)
    }

    pub const fn get(self) -> Uid {
        self.0
    }

    /// Lowest UID that is still eligible for processing.
    pub const fn next(self) -> Uid {
        self.0.saturating_add(1)
    }

    /// Whether `uid` lies strictly above the watermark.
    pub const fn admits(self, uid: Uid) -> bool {
        uid > self.0
    }

    /// Move the watermark up to `uid`. Lower values are ignored.
    pub fn advance(&mut self, uid: Uid) {
        if uid > self.0 {
            self.0 = uid;
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opens authenticated sessions against the remote store.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Open one transport connection and authenticate.
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// One authenticated connection.
///
/// Every session returned by [`MailStore::connect`] must be closed with
/// exactly one call to [`MailboxSession::disconnect`].
#[async_trait]
pub trait MailboxSession: Send {
    /// Select the folder subsequent searches and fetches apply to.
    async fn select_folder(&mut self, name: &str) -> Result<(), MailboxError>;

    /// Run a UID search. Result order is whatever the store returns.
    async fn search(&mut self, query: &str) -> Result<Vec<Uid>, MailboxError>;

    /// Fetch one whole message.
    async fn fetch(&mut self, uid: Uid) -> Result<Vec<u8>, MailboxError>;

    /// Log out. A no-op when the session is already closed; never fails.
    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_never_decreases() {
        let mut wm = Watermark::new(7);
        wm.advance(3);
        assert_eq!(wm.get(), 7);
        wm.advance(9);
        assert_eq!(wm.get(), 9);
    }

    #[test]
    fn watermark_admits_only_strictly_greater() {
        let wm = Watermark::new(7);
        assert!(!wm.admits(6));
        assert!(!wm.admits(7));
        assert!(wm.admits(8));
        assert_eq!(wm.next(), 8);
    }

    #[test]
    fn watermark_next_saturates() {
        assert_eq!(Watermark::new(u32::MAX).next(), u32::MAX);
    }
}
