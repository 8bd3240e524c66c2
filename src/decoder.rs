//! Message decoding: multipart flattening and attachment selection.
//!
//! Flattening only unwraps `multipart/alternative` containers. Any other
//! part, including other multipart kinds nested below the top level, is
//! emitted as a single leaf. Selection then keeps the parts whose content
//! type is exactly `application/octet-stream`.

use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::debug;

use crate::error::DecodeError;

/// Content type of the parts that get printed.
pub const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

/// One leaf of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    /// Lower-cased main type, e.g. `application`.
    pub maintype: String,
    /// Lower-cased subtype, e.g. `octet-stream`.
    pub subtype: String,
    /// File name from `Content-Disposition` / `Content-Type`, if any.
    pub filename: Option<String>,
    /// Payload with the transfer encoding removed.
    pub payload: Vec<u8>,
}

impl MessagePart {
    pub fn content_type(&self) -> String {
        format!("{}/{}", self.maintype, self.subtype)
    }

    fn is(&self, maintype: &str, subtype: &str) -> bool {
        self.maintype == maintype && self.subtype == subtype
    }
}

/// Parse raw RFC 822 bytes.
pub fn parse(raw: &[u8]) -> Result<Message<'_>, DecodeError> {
    MessageParser::default()
        .parse(raw)
        .ok_or(DecodeError::Unparseable { len: raw.len() })
}

/// Flatten `message` into its leaf parts, depth-first, left to right.
///
/// A non-multipart message yields itself as the only leaf.
pub fn flatten(message: &Message<'_>) -> Vec<MessagePart> {
    let Some(root) = message.parts.first() else {
        return Vec::new();
    };

    let mut stack = children(message, root).unwrap_or_else(|| vec![root]);
    stack.reverse();

    let mut leaves = Vec::new();
    while let Some(part) = stack.pop() {
        let leaf = leaf_of(part);
        debug!(content_type = %leaf.content_type(), "New payload");

        if leaf.is("multipart", "alternative") {
            if let Some(mut nested) = children(message, part) {
                nested.reverse();
                stack.extend(nested);
                continue;
            }
        }
        leaves.push(leaf);
    }
    leaves
}

/// Keep only binary attachments, preserving order.
pub fn select_attachments(parts: Vec<MessagePart>) -> Vec<MessagePart> {
    parts
        .into_iter()
        .filter(|p| p.content_type() == ATTACHMENT_CONTENT_TYPE)
        .collect()
}

/// Parse, flatten and select in one go.
pub fn extract_attachments(raw: &[u8]) -> Result<Vec<MessagePart>, DecodeError> {
    let message = parse(raw)?;
    Ok(select_attachments(flatten(&message)))
}

/// Direct children of a multipart part, or `None` for anything else.
fn children<'a, 'x>(
    message: &'a Message<'x>,
    part: &mail_parser::MessagePart<'x>,
) -> Option<Vec<&'a mail_parser::MessagePart<'x>>> {
    match &part.body {
        PartType::Multipart(ids) => Some(
            ids.iter()
                .filter_map(|&id| message.parts.get(id as usize))
                .collect(),
        ),
        _ => None,
    }
}

fn leaf_of(part: &mail_parser::MessagePart<'_>) -> MessagePart {
    // RFC 2045 default when the header is absent.
    let (maintype, subtype) = match part.content_type() {
        Some(ct) => (
            ct.ctype().to_ascii_lowercase(),
            ct.subtype().unwrap_or_default().to_ascii_lowercase(),
        ),
        None => ("text".to_string(), "plain".to_string()),
    };

    MessagePart {
        maintype,
        subtype,
        filename: part.attachment_name().map(str::to_string),
        payload: part.contents().to_vec(),
    }
}
