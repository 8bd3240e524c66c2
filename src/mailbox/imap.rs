//! IMAP4rev1 session over implicit TLS.
//!
//! The wire client is a small blocking state machine on top of a rustls
//! stream. Each round trip is pushed onto the blocking pool with
//! `spawn_blocking` so the poll loop stays responsive to cancellation.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::{MailStore, MailboxSession, Uid};

/// Socket read/write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Store ───────────────────────────────────────────────────────────

/// Opens a fresh TLS + LOGIN session on every [`MailStore::connect`].
pub struct ImapStore {
    config: MailboxConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl ImapStore {
    pub fn new(config: MailboxConfig) -> Result<Self, MailboxError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| MailboxError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            config,
            tls: Arc::new(tls),
        })
    }
}

#[async_trait]
impl MailStore for ImapStore {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let config = self.config.clone();
        let tls = Arc::clone(&self.tls);
        let conn = tokio::task::spawn_blocking(move || ImapConnection::open(&config, tls))
            .await
            .map_err(|e| MailboxError::Protocol(format!("IMAP connect task panicked: {e}")))??;

        debug!(host = %self.config.host, "IMAP session authenticated");
        Ok(Box::new(ImapSession { conn: Some(conn) }))
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Authenticated session. `conn` is `None` once logged out.
pub struct ImapSession {
    conn: Option<ImapConnection<TlsStream>>,
}

impl ImapSession {
    /// Run one blocking round trip on the connection.
    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, MailboxError>
    where
        F: FnOnce(&mut ImapConnection<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailboxError::NotConnected)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn select_folder(&mut self, name: &str) -> Result<(), MailboxError> {
        let name = name.to_string();
        self.with_conn(move |conn| conn.select(&name)).await
    }

    async fn search(&mut self, query: &str) -> Result<Vec<Uid>, MailboxError> {
        let query = query.to_string();
        self.with_conn(move |conn| conn.uid_search(&query)).await
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
        self.with_conn(move |conn| conn.uid_fetch(uid)).await
    }

    async fn disconnect(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || conn.logout()).await {
            Ok(Ok(())) => debug!("IMAP session logged out"),
            Ok(Err(e)) => debug!("IMAP logout failed, dropping connection: {e}"),
            Err(e) => warn!("IMAP logout task panicked: {e}"),
        }
    }
}

// ── Wire client ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One untagged response line plus any literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Everything the server sent for one tagged command.
#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: Status,
    text: String,
}

pub(crate) struct ImapConnection<S> {
    stream: BufReader<S>,
    tag: u32,
}

impl ImapConnection<TlsStream> {
    /// TCP connect, TLS handshake, greeting and LOGIN.
    fn open(config: &MailboxConfig, tls: Arc<rustls::ClientConfig>) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let tls_conn = rustls::ClientConnection::new(tls, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;

        let mut conn = Self::new(rustls::StreamOwned::new(tls_conn, tcp));
        conn.read_greeting()?;
        if let Err(e) = conn.login(&config.username, config.password.expose_secret()) {
            let _ = conn.logout();
            return Err(e);
        }
        Ok(conn)
    }
}

impl<S: Read + Write> ImapConnection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            tag: 0,
        }
    }

    fn read_greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                line.trim_end()
            )))
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(username), quote(password)))?;
        match resp.status {
            Status::Ok => Ok(()),
            _ => Err(MailboxError::Auth { reason: resp.text }),
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("SELECT {}", quote(folder)))?;
        match resp.status {
            Status::Ok => Ok(()),
            _ => Err(MailboxError::Folder {
                name: folder.to_string(),
                reason: resp.text,
            }),
        }
    }

    fn uid_search(&mut self, query: &str) -> Result<Vec<Uid>, MailboxError> {
        let resp = self.command(&format!("UID SEARCH {query}"))?;
        if resp.status != Status::Ok {
            return Err(MailboxError::Search(resp.text));
        }

        let mut uids = Vec::new();
        for line in &resp.untagged {
            let Some(rest) = line.text.strip_prefix("* SEARCH") else {
                continue;
            };
            for token in rest.split_whitespace() {
                let uid = token.parse().map_err(|_| {
                    MailboxError::Search(format!("unexpected token {token:?} in SEARCH response"))
                })?;
                uids.push(uid);
            }
        }
        Ok(uids)
    }

    fn uid_fetch(&mut self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
        let resp = self.command(&format!("UID FETCH {uid} (RFC822)"))?;
        if resp.status != Status::Ok {
            return Err(MailboxError::Fetch {
                uid,
                reason: resp.text,
            });
        }

        resp.untagged
            .into_iter()
            .filter(|line| line.text.contains(" FETCH "))
            .find_map(|line| line.literals.into_iter().next())
            .ok_or_else(|| MailboxError::Fetch {
                uid,
                reason: "no message body in FETCH response".into(),
            })
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }

    /// Send one tagged command and collect the response up to its tagged status.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        debug!(tag = %tag, command = %verb, "IMAP command");

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(rest) = line.text.strip_prefix(&prefix) {
                let (status, text) = parse_status(rest)?;
                return Ok(Response {
                    untagged,
                    status,
                    text,
                });
            }
            untagged.push(line);
        }
    }

    /// Read one logical response line, pulling in every literal it announces.
    fn read_response_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut resp = ResponseLine::default();
        loop {
            let line = self.read_line()?;
            resp.text.push_str(line.trim_end_matches(['\r', '\n']));
            match literal_len(&line) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    resp.literals.push(literal);
                }
                None => return Ok(resp),
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err(MailboxError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "IMAP connection closed",
            )));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Split `OK text` / `NO text` / `BAD text`.
fn parse_status(rest: &str) -> Result<(Status, String), MailboxError> {
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        other => {
            return Err(MailboxError::Protocol(format!(
                "unexpected tagged status {other:?}"
            )));
        }
    };
    Ok((status, text.to_string()))
}

/// Length of the literal announced at the end of `line` (`{123}` or `{123+}`).
fn literal_len(line: &str) -> Option<usize> {
    let body = line.trim_end_matches(['\r', '\n']).strip_suffix('}')?;
    let start = body.rfind('{')?;
    body[start + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
