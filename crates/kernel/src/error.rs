use worldbase_common::{EntityTypeId, EnvironmentBasedId, EnvironmentId, IdError, TileId};
use worldbase_config::ConfigError;

/// Errors from world database operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    // configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("tile map references unknown tile id {0}")]
    UnknownTileId(i32),
    #[error("tile map contains invalid tile id {0}")]
    InvalidTileId(i32),
    #[error("invalid tile rotation {0} (expected 0, 90, 180 or 270)")]
    InvalidRotation(i32),
    #[error("no avatar factory accepts class {0}")]
    NoAvatarFactory(String),
    #[error("no environment layout has been loaded")]
    NoLayout,

    // lookup
    #[error("entity type {0} not found")]
    UnknownEntityType(EntityTypeId),
    #[error("environment {0} not found")]
    UnknownEnvironment(EnvironmentId),
    #[error("entity {0} not found")]
    UnknownEntity(EnvironmentBasedId),
    #[error("tile {0} not found")]
    UnknownTile(TileId),

    // capacity
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("tile {tile} does not fit at ({x}, {z}) in a {size_x}x{size_z} grid")]
    TileOutOfBounds {
        tile: TileId,
        x: i32,
        z: i32,
        size_x: u32,
        size_z: u32,
    },
    #[error("tile {tile} at ({x}, {z}) conflicts with an existing tile at ({at_x}, {at_z})")]
    TileOverlap {
        tile: TileId,
        x: i32,
        z: i32,
        at_x: i32,
        at_z: i32,
    },
    #[error("tile {tile} size {x_size}x{z_size} not a multiple of spacing {x_spacing}x{z_spacing}")]
    MisalignedTile {
        tile: TileId,
        x_size: u32,
        z_size: u32,
        x_spacing: u32,
        z_spacing: u32,
    },

    // consistency and validation
    #[error("environment id {0} is already in use")]
    EnvironmentIdInUse(EnvironmentId),
    #[error("entity type id {0} is already in use")]
    EntityTypeIdInUse(EntityTypeId),
    #[error("tile id {0} is already in use")]
    TileIdInUse(TileId),
    #[error("position ({x}, {z}) is not a multiple of grid spacing {x_spacing}x{z_spacing}")]
    MisalignedPosition {
        x: i32,
        z: i32,
        x_spacing: u32,
        z_spacing: u32,
    },
    #[error("environment {id} would overlap environment {other}")]
    EnvironmentOverlap {
        id: EnvironmentId,
        other: EnvironmentId,
    },
    #[error("entity {id} does not originate in environment {env}")]
    ForeignOrigin {
        id: EnvironmentBasedId,
        env: EnvironmentId,
    },
    #[error("entity {0} already exists")]
    DuplicateEntity(EnvironmentBasedId),
    #[error("entity {id} is not resident in environment {env}")]
    NotResident {
        id: EnvironmentBasedId,
        env: EnvironmentId,
    },
    #[error("grid spacing must be positive, got {x}x{z}")]
    InvalidSpacing { x: u32, z: u32 },
    #[error("grid spacing cannot change while environments exist")]
    SpacingLocked,

    // wire
    #[error("event encode error: {0}")]
    Encode(String),
    #[error("event decode error: {0}")]
    Decode(String),
}
