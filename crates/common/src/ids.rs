use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id_pool::IdError;

/// Numeric id of an entity type.
pub type EntityTypeId = u16;

/// Numeric id of an environment.
pub type EnvironmentId = u16;

/// Numeric id of a master tile.
pub type TileId = u32;

fn half(value: u32) -> Result<u16, IdError> {
    u16::try_from(value).map_err(|_| IdError::IdOutOfRange(value))
}

/// Identity of an entity relative to the environment it was created in.
///
/// Stable for the entity's whole life: `origin` records where the entity was
/// created, not where it currently resides.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(from = "u32", into = "u32")]
pub struct EnvironmentBasedId {
    pub origin: EnvironmentId,
    pub local: u16,
}

impl EnvironmentBasedId {
    pub const fn new(origin: EnvironmentId, local: u16) -> Self {
        Self { origin, local }
    }

    /// Build from untyped halves, rejecting values that do not fit in 16 bits.
    pub fn try_new(origin: u32, local: u32) -> Result<Self, IdError> {
        Ok(Self::new(half(origin)?, half(local)?))
    }

    /// Packed 32-bit wire form: origin in the high half.
    pub const fn to_wire(self) -> u32 {
        ((self.origin as u32) << 16) | self.local as u32
    }

    pub const fn from_wire(raw: u32) -> Self {
        Self {
            origin: (raw >> 16) as u16,
            local: (raw & 0xFFFF) as u16,
        }
    }
}

impl From<u32> for EnvironmentBasedId {
    fn from(raw: u32) -> Self {
        Self::from_wire(raw)
    }
}

impl From<EnvironmentBasedId> for u32 {
    fn from(id: EnvironmentBasedId) -> Self {
        id.to_wire()
    }
}

impl fmt::Display for EnvironmentBasedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env{}:{}", self.origin, self.local)
    }
}

/// Identity of an entity within its entity type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(from = "u32", into = "u32")]
pub struct TypeBasedId {
    pub entity_type: EntityTypeId,
    pub instance: u16,
}

impl TypeBasedId {
    pub const fn new(entity_type: EntityTypeId, instance: u16) -> Self {
        Self {
            entity_type,
            instance,
        }
    }

    pub fn try_new(entity_type: u32, instance: u32) -> Result<Self, IdError> {
        Ok(Self::new(half(entity_type)?, half(instance)?))
    }

    /// Packed 32-bit wire form: type id in the high half.
    pub const fn to_wire(self) -> u32 {
        ((self.entity_type as u32) << 16) | self.instance as u32
    }

    pub const fn from_wire(raw: u32) -> Self {
        Self {
            entity_type: (raw >> 16) as u16,
            instance: (raw & 0xFFFF) as u16,
        }
    }
}

impl From<u32> for TypeBasedId {
    fn from(raw: u32) -> Self {
        Self::from_wire(raw)
    }
}

impl From<TypeBasedId> for u32 {
    fn from(id: TypeBasedId) -> Self {
        id.to_wire()
    }
}

impl fmt::Display for TypeBasedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type{}:{}", self.entity_type, self.instance)
    }
}
