//! Node Identifiers
//!
//! Every node in a signal tree is addressed by an [`Id`]. Ids are random
//! 64-bit tokens, so independently created commands (possibly on different
//! cluster members) never need coordination to pick a fresh id.
//!
//! Two values are reserved:
//!
//! - [`Id::ZERO`] addresses the root node of every tree.
//! - [`Id::EDGE`] marks "the edge of a list" in list positions.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque identifier of a node or a command.
///
/// The ordering has no numeric meaning. It only exists so that collections
/// of ids can be iterated deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    /// The id of the root node.
    pub const ZERO: Id = Id(0);

    /// The reserved maximum id, used as the list edge in positions.
    pub const EDGE: Id = Id(u64::MAX);

    /// Generate a new random id that is neither of the reserved sentinels.
    pub fn random() -> Self {
        loop {
            let raw: u64 = rand::random();
            if raw != Self::ZERO.0 && raw != Self::EDGE.0 {
                return Self(raw);
            }
        }
    }

    /// Create an id from its raw representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Whether this is one of the two reserved sentinels.
    pub fn is_reserved(&self) -> bool {
        *self == Self::ZERO || *self == Self::EDGE
    }

    /// Shard index used by tree revisions.
    pub(crate) fn shard(&self, shards: usize) -> usize {
        // Random ids are already well mixed; folding keeps sequential test
        // ids spread out as well.
        ((self.0 ^ (self.0 >> 29)) % shards as u64) as usize
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ZERO => f.write_str("Id(ZERO)"),
            Self::EDGE => f.write_str("Id(EDGE)"),
            _ => write!(f, "Id({:016x})", self.0),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Error returned when parsing an [`Id`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id: {0:?}")]
pub struct ParseIdError(String);

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(ParseIdError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Id)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hex encoded id or an unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Id, E> {
                Ok(Id(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Id, E> {
                v.parse().map_err(E::custom)
            }
        }

        // Buffered formats may not report human readability faithfully, so
        // both encodings are accepted.
        deserializer.deserialize_any(IdVisitor)
    }
}
