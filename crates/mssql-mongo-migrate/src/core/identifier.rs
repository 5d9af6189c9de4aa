//! Surrogate identifiers assigned to migrated records.
//!
//! Every source row receives a fresh [`Identifier`] when it is replicated.
//! Allocation is stateless: uniqueness follows from 122 random bits per
//! identifier, so tables can be replicated in parallel without coordination.

use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque surrogate key of a migrated record.
///
/// Stored in MongoDB as BSON binary subtype 4 (UUID). No source value is
/// ever written with that subtype, which makes already-remapped fields
/// recognisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// BSON representation used for `_id` and remapped foreign-key fields.
    pub fn to_bson(&self) -> Bson {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: self.0.as_bytes().to_vec(),
        })
    }

    /// Parse an identifier from BSON. Returns `None` for any other value.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Binary(b) if b.subtype == BinarySubtype::Uuid => {
                Uuid::from_slice(&b.bytes).ok().map(Self)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of fresh surrogate identifiers.
pub trait IdentifierAllocator: Send + Sync {
    /// Produce an identifier unique within the target store.
    fn allocate(&self) -> Identifier;
}

/// Allocator backed by random (v4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdAllocator;

impl IdentifierAllocator for RandomIdAllocator {
    fn allocate(&self) -> Identifier {
        Identifier(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocations_are_distinct() {
        let alloc = RandomIdAllocator;
        let ids: HashSet<_> = (0..10_000).map(|_| alloc.allocate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_bson_round_trip() {
        let id = RandomIdAllocator.allocate();
        assert_eq!(Identifier::from_bson(&id.to_bson()), Some(id));
    }

    #[test]
    fn test_other_values_are_not_identifiers() {
        assert_eq!(Identifier::from_bson(&Bson::Int32(9)), None);
        assert_eq!(Identifier::from_bson(&Bson::String("9".into())), None);
        let generic = Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![0; 16],
        });
        assert_eq!(Identifier::from_bson(&generic), None);
    }
}
