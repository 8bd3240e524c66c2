//! Search query construction.

use crate::config::FilterCriteria;
use crate::mailbox::Watermark;

/// Build the UID SEARCH key list for `criteria` above `watermark`.
///
/// Produces e.g. `(FROM "me@example.com" SUBJECT "print" UID 9:*)`.
/// Values are quoted verbatim with no escaping.
pub fn search_query(criteria: &FilterCriteria, watermark: Watermark) -> String {
    let mut keys: Vec<String> = criteria
        .iter()
        .map(|(field, value)| format!("{field} \"{value}\""))
        .collect();
    keys.push(format!("UID {}:*", watermark.next()));
    format!("({})", keys.join(" "))
}
