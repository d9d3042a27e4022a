//! Shared types for the spam pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Users ───────────────────────────────────────────────────────────

/// A resolved user record.
///
/// `email` is the canonical identity; two users with the same email are
/// the same user no matter which address resolved them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
}

// ── Messages ────────────────────────────────────────────────────────

/// Opaque, totally ordered message identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A candidate message returned by the batched fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// `User::id` of the mailbox the message was fetched for.
    pub owner: u64,
}

// ── Classification ──────────────────────────────────────────────────

/// Spam verdict for one message. Produced exactly once per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: MessageId,
    pub is_spam: bool,
}

impl Classification {
    /// Format as a report line: `"<is_spam> <message_id>"`.
    pub fn to_report_line(&self) -> ReportLine {
        ReportLine(format!("{} {}", self.is_spam, self.message_id))
    }
}

/// One line of the final report, e.g. `"true 42"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportLine(String);

impl ReportLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<&str> for ReportLine {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
