//! Closed set of audited operation kinds.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Kind of operation a handler or entity change performed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// A new resource was created.
    Create,
    /// An existing resource was modified.
    Update,
    /// A resource was removed.
    Delete,
    /// Read-only query.
    Query,
}

impl OperationType {
    /// Stable lowercase name used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Query => "query",
        }
    }

    /// Parse a caller-supplied operation name.
    ///
    /// Matching is case-insensitive so boundary integrations may pass
    /// `"Create"` or `"create"`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for any name outside the closed set.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "query" => Ok(Self::Query),
            _ => Err(AppError::Validation(format!(
                "unrecognized operation type: {raw:?}"
            ))),
        }
    }

    /// Whether the operation mutates state.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Query)
    }
}

impl FromStr for OperationType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
