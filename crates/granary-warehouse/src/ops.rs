//! Schema-change operations as published by the schema registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The kind of schema change an [`Operation`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Add a column.
    Add,
    /// Drop a column (CASCADE).
    Delete,
    /// Rename a column.
    Rename,
    /// Sentinel: a drop of the whole event stream was requested. No DDL.
    RequestDropEvent,
    /// Sentinel: the event stream is dropped. No DDL; short-circuits
    /// table creation.
    DropEvent,
    /// Sentinel: a pending drop was cancelled. No DDL.
    CancelDropEvent,
}

/// One ordered step of a table migration.
///
/// `metadata` carries action-specific detail: `column_type` and
/// `column_options` for adds, `new_outbound` for renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// What to do.
    pub action: Action,
    /// The column the action applies to.
    pub column: String,
    /// Action-specific metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Operation {
    /// Creates an ADD-column operation.
    #[must_use]
    pub fn add(column: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            action: Action::Add,
            column: column.into(),
            metadata: HashMap::from([
                ("column_type".to_string(), column_type.into()),
                ("column_options".to_string(), String::new()),
            ]),
        }
    }

    /// Whether this operation is one of the drop/cancel sentinels that
    /// produce no DDL.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self.action,
            Action::RequestDropEvent | Action::DropEvent | Action::CancelDropEvent
        )
    }
}
