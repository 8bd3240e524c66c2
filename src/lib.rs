//! Watch a mailbox and print the attachments of matching mail.

pub mod config;
pub mod decoder;
pub mod error;
pub mod mailbox;
pub mod poll_loop;
pub mod printer;
pub mod shutdown;
pub mod stager;
