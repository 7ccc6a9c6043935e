//! Core type definitions for datagate.

use crate::error::{CoreError, CoreResult, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A stored or returned record: a JSON object keyed by property name.
pub type Row = serde_json::Map<String, serde_json::Value>;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Returns the raw index.
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Index of a dataset in the manifest arena.
    DatasetId
);
arena_id!(
    /// Index of a resource in the manifest arena.
    ResourceId
);
arena_id!(
    /// Index of a model in the manifest arena.
    ModelId
);
arena_id!(
    /// Index of a property in the manifest arena.
    PropertyId
);

/// Access level of a node. Ordered from most to least restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Only reachable with a property-specific scope.
    Private,
    /// Reachable by clients authorized for the model.
    Protected,
    /// Reachable by anyone.
    #[serde(alias = "open")]
    Public,
}

impl Access {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Protected => "protected",
            Self::Public => "public",
        }
    }
}

impl FromStr for Access {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.trim() {
            "private" => Ok(Self::Private),
            "protected" => Ok(Self::Protected),
            "public" | "open" => Ok(Self::Public),
            other => Err(ErrorKind::InvalidValue
                .err()
                .with("value", other)
                .with("expected", "private, protected or public")
                .into()),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions a request can perform on a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create a new row.
    Insert,
    /// Insert or patch depending on whether the row exists.
    Upsert,
    /// Full replace.
    Update,
    /// Partial update.
    Patch,
    /// Remove one row.
    Delete,
    /// Remove every row of a model.
    Wipe,
    /// Read one row.
    Getone,
    /// List rows.
    Getall,
    /// List rows with a filter.
    Search,
    /// Read the change log.
    Changes,
}

impl Action {
    /// Lowercase name, also used in scope strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Upsert => "upsert",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Wipe => "wipe",
            Self::Getone => "getone",
            Self::Getall => "getall",
            Self::Search => "search",
            Self::Changes => "changes",
        }
    }

    /// Returns `true` for actions that modify data.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Upsert | Self::Update | Self::Patch | Self::Delete | Self::Wipe
        )
    }
}

impl FromStr for Action {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Ok(match s {
            "insert" => Self::Insert,
            "upsert" => Self::Upsert,
            "update" => Self::Update,
            "patch" => Self::Patch,
            "delete" => Self::Delete,
            "wipe" => Self::Wipe,
            "getone" => Self::Getone,
            "getall" => Self::Getall,
            "search" => Self::Search,
            "changes" => Self::Changes,
            other => {
                return Err(ErrorKind::UnknownAction.err().with("action", other).into());
            }
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-row revision token used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Generates a fresh random revision.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an existing revision string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the revision string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a backend transaction. Change entries written in the same
/// transaction share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(String);

impl TxnId {
    /// Generates a fresh random transaction id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a new row id.
#[must_use]
pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_is_ordered() {
        assert!(Access::Private < Access::Protected);
        assert!(Access::Protected < Access::Public);
        assert_eq!("open".parse::<Access>().unwrap(), Access::Public);
        assert!("secret".parse::<Access>().is_err());
    }

    #[test]
    fn action_roundtrip() {
        for action in [Action::Insert, Action::Wipe, Action::Changes] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!(Action::Patch.is_write());
        assert!(!Action::Getall.is_write());
        assert_eq!(
            "explode".parse::<Action>().unwrap_err().code(),
            "UnknownAction"
        );
    }

    #[test]
    fn revisions_are_unique() {
        assert_ne!(Revision::generate(), Revision::generate());
    }
}
