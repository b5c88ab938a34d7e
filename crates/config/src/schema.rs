use glam::Vec3;
use serde::{Deserialize, Serialize};
use worldbase_common::{EntityTypeId, EnvironmentId, TileId, Transform};

use crate::ConfigError;

/// How an instance copies its visual representation from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    /// Share geometry with the template.
    Shallow,
    /// Copy everything.
    #[default]
    Deep,
}

/// Reference to a visual representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub file: String,
    #[serde(default)]
    pub clone_mode: CloneMode,
}

fn default_implementation_class() -> String {
    "EntityType".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeConfig {
    pub type_id: EntityTypeId,
    /// Factory key used to build the type.
    #[serde(default = "default_implementation_class")]
    pub implementation_class: String,
    pub name: String,
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub representation: Option<ModelConfig>,
}

/// Root of an entity type file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTypesConfig {
    pub entity_types: Vec<EntityTypeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileConfig {
    pub id: TileId,
    #[serde(default)]
    pub name: String,
    /// World units, a multiple of the grid spacing.
    pub x_size: u32,
    pub z_size: u32,
    #[serde(default)]
    pub height: f32,
    /// Degrees: 0, 90, 180 or 270.
    #[serde(default)]
    pub y_rotation: i32,
    #[serde(default)]
    pub representation: Option<ModelConfig>,
}

/// Root of a tile file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TilesConfig {
    pub tiles: Vec<TileConfig>,
}

/// Grid spacing plus the placement of every environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentLayoutConfig {
    pub x_spacing: u32,
    pub z_spacing: u32,
    #[serde(default)]
    pub environments: Vec<EnvironmentPlacementConfig>,
}

impl EnvironmentLayoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.x_spacing == 0 || self.z_spacing == 0 {
            return Err(ConfigError::Invalid(format!(
                "grid spacing must be positive, got {}x{}",
                self.x_spacing, self.z_spacing
            )));
        }
        for (i, placement) in self.environments.iter().enumerate() {
            if self.environments[..i].iter().any(|p| p.id == placement.id) {
                return Err(ConfigError::Invalid(format!(
                    "environment id {} listed twice in layout",
                    placement.id
                )));
            }
            if let Some(env) = &placement.environment {
                env.validate()?;
            }
        }
        Ok(())
    }
}

/// One environment in the layout. The environment itself is either inline or
/// in `config_file`, resolved relative to the layout file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentPlacementConfig {
    pub id: EnvironmentId,
    /// Grid coordinates.
    pub x_loc: i32,
    pub z_loc: i32,
    #[serde(default)]
    pub config_file: Option<String>,
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointConfig {
    pub position: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub type_id: EntityTypeId,
    /// Local id within the environment; below the load-time bound.
    pub id: u16,
    #[serde(default)]
    pub transform: Transform,
}

/// Contents of one environment: tile-id matrix, entities, entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub x_dimension: u32,
    pub z_dimension: u32,
    /// Row `z`, column `x`. 0 is empty, a positive value is a tile id.
    pub tile_map: Vec<Vec<i32>>,
    #[serde(default)]
    pub entry_points: Vec<EntryPointConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

impl EnvironmentConfig {
    /// Check the tile map against the declared dimensions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.x_dimension == 0 || self.z_dimension == 0 {
            return Err(ConfigError::Invalid(format!(
                "environment dimensions must be positive, got {}x{}",
                self.x_dimension, self.z_dimension
            )));
        }
        if self.tile_map.len() != self.z_dimension as usize {
            return Err(ConfigError::Invalid(format!(
                "tile map has {} rows, expected {}",
                self.tile_map.len(),
                self.z_dimension
            )));
        }
        if let Some((z, row)) = self
            .tile_map
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.x_dimension as usize)
        {
            return Err(ConfigError::Invalid(format!(
                "tile map row {z} has {} columns, expected {}",
                row.len(),
                self.x_dimension
            )));
        }
        Ok(())
    }

    /// Tile id at `(x, z)`, or 0 outside the map.
    pub fn tile_id_at(&self, x: usize, z: usize) -> i32 {
        self.tile_map
            .get(z)
            .and_then(|row| row.get(x))
            .copied()
            .unwrap_or(0)
    }
}

fn default_avatar_class() -> String {
    "SimpleAvatar".to_string()
}

/// A user's avatar: factory key, display name, representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarConfig {
    #[serde(default = "default_avatar_class")]
    pub implementation_class: String,
    pub name: String,
    pub representation: ModelConfig,
    #[serde(default)]
    pub transform: Transform,
}

/// Entire world in one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    #[serde(default)]
    pub entity_types: Vec<EntityTypeConfig>,
    #[serde(default)]
    pub tiles: Vec<TileConfig>,
    pub layout: EnvironmentLayoutConfig,
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()
    }
}
