//! Configuration types.
//!
//! Everything is read once from the environment at startup and never
//! mutated afterwards. The orchestrator receives it behind an `Arc`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Field name to required substring. All entries must match (logical AND).
///
/// Entries keep their configured order so the generated search query is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCriteria {
    fields: Vec<(String, String)>,
}

impl FilterCriteria {
    /// Build criteria from `(field, value)` pairs.
    ///
    /// Field names are upper-cased. Values are kept verbatim; embedded
    /// double quotes are NOT escaped when the query is rendered, so callers
    /// must not pass them.
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into().to_ascii_uppercase(), v.into()))
                .collect(),
        }
    }

    /// Parse `FIELD=value;FIELD=value`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (field, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::ParseError(format!("missing '=' in {entry:?}")))?;
            let field = field.trim();
            let value = value.trim();
            if field.is_empty() || value.is_empty() {
                return Err(ConfigError::ParseError(format!(
                    "empty field or value in {entry:?}"
                )));
            }
            if !field.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
                return Err(ConfigError::ParseError(format!(
                    "invalid search key {field:?}"
                )));
            }
            fields.push((field, value));
        }
        if fields.is_empty() {
            return Err(ConfigError::ParseError(
                "filter criteria must contain at least one FIELD=value entry".into(),
            ));
        }
        Ok(Self::new(fields))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for FilterCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{field}={value}")?;
        }
        Ok(())
    }
}

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

/// Printer settings.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    /// CUPS destination name.
    pub name: String,
    /// Value passed as `-o sides=...`.
    pub sides: String,
    /// Interval between queue status polls.
    pub drain_poll_interval: Duration,
    /// Delay after submission before the first queue poll.
    pub drain_settle_delay: Duration,
}

/// Attachment staging settings.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub dir: PathBuf,
    pub extension: String,
    /// Keep staged files after printing.
    pub keep_attachments: bool,
}

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct PrintConfig {
    pub mailbox: MailboxConfig,
    pub filter: FilterCriteria,
    pub printer: PrinterConfig,
    pub staging: StagingConfig,
    /// Wait between poll cycles.
    pub poll_interval: Duration,
    /// Directory for rolling log files. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl PrintConfig {
    /// Build config for one printer from environment variables.
    pub fn from_env(printer: &str) -> Result<Self, ConfigError> {
        if printer.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "printer".into(),
                message: "printer name must not be empty".into(),
            });
        }

        let host = required("EMAIL_IMAP_HOST")?;
        let port: u16 = parsed("EMAIL_IMAP_PORT", 993)?;
        let username = required("EMAIL_USERNAME")?;
        let password = SecretString::from(required("EMAIL_PASSWORD")?);
        let folder = std::env::var("MAILPRINT_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        let filter_key = printer_filter_var(printer);
        let raw_filter = std::env::var(&filter_key)
            .or_else(|_| std::env::var("MAILPRINT_FILTER"))
            .map_err(|_| ConfigError::MissingEnvVar(format!("{filter_key} or MAILPRINT_FILTER")))?;
        let filter = FilterCriteria::parse(&raw_filter)?;

        let poll_interval = Duration::from_secs(parsed("MAILPRINT_POLL_INTERVAL_SECS", 5)?);
        let drain_poll_interval = Duration::from_millis(parsed("MAILPRINT_DRAIN_POLL_MS", 1500)?);
        let drain_settle_delay = Duration::from_millis(parsed("MAILPRINT_DRAIN_SETTLE_MS", 1000)?);
        let sides = std::env::var("MAILPRINT_SIDES")
            .unwrap_or_else(|_| "two-sided-long-edge".to_string());

        let staging_dir = std::env::var("MAILPRINT_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let extension =
            std::env::var("MAILPRINT_ATTACHMENT_EXT").unwrap_or_else(|_| "pdf".to_string());
        let keep_attachments = parsed("MAILPRINT_KEEP_ATTACHMENTS", false)?;

        let log_dir = match std::env::var("MAILPRINT_LOG_DIR") {
            Ok(dir) if dir.is_empty() => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => Some(PathBuf::from("./log")),
        };

        Ok(Self {
            mailbox: MailboxConfig {
                host,
                port,
                username,
                password,
                folder,
            },
            filter,
            printer: PrinterConfig {
                name: printer.to_string(),
                sides,
                drain_poll_interval,
                drain_settle_delay,
            },
            staging: StagingConfig {
                dir: staging_dir,
                extension,
                keep_attachments,
            },
            poll_interval,
            log_dir,
        })
    }
}

/// Name of the per-printer filter variable, e.g. `MAILPRINT_FILTER_OFFICE_2`.
pub fn printer_filter_var(printer: &str) -> String {
    let suffix: String = printer
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MAILPRINT_FILTER_{suffix}")
}

fn required(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
