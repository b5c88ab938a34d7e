use std::fmt::Write as _;
use worldbase_common::{TileId, Transform};
use worldbase_config::TileConfig;

use crate::error::WorldError;
use crate::model::{Model, clone_model, model_from_config};

/// Rotation of a tile about the vertical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl TileRotation {
    pub fn degrees(self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

impl TryFrom<i32> for TileRotation {
    type Error = WorldError;

    fn try_from(degrees: i32) -> Result<Self, WorldError> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(WorldError::InvalidRotation(degrees)),
        }
    }
}

/// Static, grid-aligned piece of world geometry.
///
/// Masters live in the database; every grid placement owns a clone. Cloning
/// copies the scalar fields, clones the model per its clone mode and resets
/// the placement to "not attached".
#[derive(Debug)]
pub struct Tile {
    id: TileId,
    name: String,
    x_size: u32,
    z_size: u32,
    height: f32,
    y_rotation: TileRotation,
    model: Option<Box<dyn Model>>,
    placement: Option<Transform>,
}

impl Tile {
    pub fn new(id: TileId, name: impl Into<String>, x_size: u32, z_size: u32) -> Self {
        Self {
            id,
            name: name.into(),
            x_size,
            z_size,
            height: 0.0,
            y_rotation: TileRotation::Deg0,
            model: None,
            placement: None,
        }
    }

    pub fn from_config(config: &TileConfig) -> Result<Self, WorldError> {
        Ok(Self::new(config.id, config.name.clone(), config.x_size, config.z_size)
            .with_height(config.height)
            .with_rotation(TileRotation::try_from(config.y_rotation)?)
            .with_model(model_from_config(config.representation.as_ref())))
    }

    pub fn with_height(mut self, height: f32) -> Self {
        self.height = height;
        self
    }

    pub fn with_rotation(mut self, rotation: TileRotation) -> Self {
        self.y_rotation = rotation;
        self
    }

    pub fn with_model(mut self, model: Option<Box<dyn Model>>) -> Self {
        self.model = model;
        self
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width along X in world units.
    pub fn x_size(&self) -> u32 {
        self.x_size
    }

    /// Depth along Z in world units.
    pub fn z_size(&self) -> u32 {
        self.z_size
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn y_rotation(&self) -> TileRotation {
        self.y_rotation
    }

    pub fn model(&self) -> Option<&dyn Model> {
        self.model.as_deref()
    }

    /// Environment-local placement, set while the tile sits in a grid.
    pub fn placement(&self) -> Option<&Transform> {
        self.placement.as_ref()
    }

    pub(crate) fn set_placement(&mut self, placement: Option<Transform>) {
        self.placement = placement;
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "Tile {} '{}': size={}x{} height={:.2} rotation={}",
            self.id,
            self.name,
            self.x_size,
            self.z_size,
            self.height,
            self.y_rotation.degrees()
        );
        if let Some(model) = &self.model {
            let _ = write!(out, " model={}", model.source());
        }
        out
    }
}

impl Clone for Tile {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            x_size: self.x_size,
            z_size: self.z_size,
            height: self.height,
            y_rotation: self.y_rotation,
            model: self.model.as_deref().map(clone_model),
            placement: None,
        }
    }
}
