//! Shared types for the world database.
//!
//! # Invariants
//! - Dual identifiers are explicit pairs of 16-bit halves; conversion to and
//!   from the 32-bit wire form is lossless and range-checked.
//! - An `IdPool` never hands out the same id twice while it is outstanding,
//!   and never hands out ids that fall inside a carved sub-pool.

pub mod id_pool;
pub mod ids;
pub mod types;

pub use id_pool::{IdError, IdPool, IdPoolRegistry};
pub use ids::{EntityTypeId, EnvironmentBasedId, EnvironmentId, TileId, TypeBasedId};
pub use types::Transform;

pub fn crate_info() -> &'static str {
    "worldbase-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
