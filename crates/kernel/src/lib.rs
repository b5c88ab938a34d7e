//! World database: environments laid out on a grid, the tiles that floor
//! them, entity types and their instances, and the events that mutate them.
//!
//! # Invariants
//! - Every resident entity lives in exactly one environment and is recorded
//!   as an instance of exactly one entity type.
//! - Entities are created and destroyed only by executing world events, so
//!   every peer applies the same mutations in the same order.
//! - Entity transforms are stored relative to their environment; world
//!   transforms are derived from the environment's grid position.
//! - The database works without a scene graph; render hooks are notified
//!   when one is installed.

pub mod database;
pub mod entity;
pub mod entity_type;
pub mod environment;
pub mod error;
pub mod events;
pub mod factory;
pub mod grid;
pub mod model;
pub mod pools;
pub mod scene;
pub mod tile;

pub use database::{AvatarHandle, WorldDatabase};
pub use entity::{AttachmentKey, Entity, EntityCallback, EntityState};
pub use entity_type::EntityType;
pub use environment::Environment;
pub use error::WorldError;
pub use events::{
    CreateEntityEvent, CreateEnvironmentEvent, DestroyEntityEvent, EventQueue, ExecutionScope,
    NetMessage, ReloadEnvironmentsEvent, WorldEvent,
};
pub use factory::{
    Avatar, AvatarFactory, DefaultEntityTypeFactory, EntityTypeFactory, SimpleAvatar,
    SimpleAvatarFactory,
};
pub use grid::{CellCoord, GridSpacing, TileGrid};
pub use model::{FileModel, Model};
pub use scene::{SceneGraph, SharedSceneGraph};
pub use tile::{Tile, TileRotation};

pub fn crate_info() -> &'static str {
    "worldbase-kernel v0.1.0"
}
