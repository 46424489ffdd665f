//! Redb table definitions for persistent metadata storage.
//!
//! Every value is `version (u64, big-endian) ++ payload`; the version prefix
//! is what compare-and-set compares against.

use redb::TableDefinition;
use std::fmt;

// Key: scope name, Value: bincode-encoded scope record
pub const SCOPES: TableDefinition<&str, &[u8]> = TableDefinition::new("scopes");
// Key: "scope/stream", Value: bincode-encoded stream record (epochs, segments, scale op)
pub const STREAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("streams");

/// Logical table addressed through [`crate::KvStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Scopes,
    Streams,
}

impl Table {
    /// All tables, in creation order
    pub const ALL: [Self; 2] = [Self::Scopes, Self::Streams];

    pub(crate) const fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Scopes => SCOPES,
            Self::Streams => STREAMS,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scopes => "scopes",
            Self::Streams => "streams",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
