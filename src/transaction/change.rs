// ============================================================================
// Buffered Writes
// ============================================================================
//
// Writes staged inside an open transaction. They are applied in order on
// COMMIT and discarded on ROLLBACK.
//
// ============================================================================

use serde_json::Value as JsonValue;

/// A single write recorded in an open transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or replace the value stored under `key`
    Put { key: String, value: JsonValue },

    /// Remove `key`
    Delete { key: String },
}

impl Change {
    /// Get the key affected by this change
    pub fn key(&self) -> &str {
        match self {
            Change::Put { key, .. } => key,
            Change::Delete { key } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_key() {
        let put = Change::Put {
            key: "accounts:1".to_string(),
            value: json!({ "balance": 10 }),
        };
        assert_eq!(put.key(), "accounts:1");
        assert!(!put.is_delete());

        let delete = Change::Delete {
            key: "accounts:2".to_string(),
        };
        assert_eq!(delete.key(), "accounts:2");
        assert!(delete.is_delete());
    }
}
