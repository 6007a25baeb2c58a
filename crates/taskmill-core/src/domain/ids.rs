//! Task identifiers.
//!
//! Ids are plain strings so producers can pick their own (for example the id of
//! the alert a task is about). System-assigned ids are ULID based and carry the
//! `task-` prefix, which keeps them sortable by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Prefix used for system-generated task ids.
pub const TASK_ID_PREFIX: &str = "task-";

/// Identifier of a task record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build a system id from a ULID (`task-<ulid>`).
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{TASK_ID_PREFIX}{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids end up inside store keys, so whitespace and the key separator are rejected.
    pub fn is_valid(value: &str) -> bool {
        !value.is_empty()
            && value.len() <= 256
            && !value.chars().any(|c| c.is_whitespace() || c == ':')
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_ids_carry_prefix_and_sort_by_time() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1.as_str().starts_with(TASK_ID_PREFIX));
        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::new("alert-42");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"alert-42\"");
    }

    #[test]
    fn rejects_ids_that_break_store_keys() {
        assert!(TaskId::is_valid("alert-42"));
        assert!(!TaskId::is_valid(""));
        assert!(!TaskId::is_valid("a b"));
        assert!(!TaskId::is_valid("queue:evil"));
    }
}
