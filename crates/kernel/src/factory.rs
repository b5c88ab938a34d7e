use std::fmt;
use worldbase_common::Transform;
use worldbase_config::{AvatarConfig, EntityTypeConfig};

use crate::entity_type::{DEFAULT_ENTITY_TYPE_CLASS, EntityType};
use crate::model::{FileModel, Model};

/// Builds entity types for the implementation classes it knows.
pub trait EntityTypeFactory {
    /// `None` if this factory does not handle `config.implementation_class`.
    fn create(&self, config: &EntityTypeConfig) -> Option<EntityType>;
}

/// Factory for the built-in `"EntityType"` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEntityTypeFactory;

impl EntityTypeFactory for DefaultEntityTypeFactory {
    fn create(&self, config: &EntityTypeConfig) -> Option<EntityType> {
        (config.implementation_class == DEFAULT_ENTITY_TYPE_CLASS)
            .then(|| EntityType::from_config(config))
    }
}

/// A user's visual presence in the world. Avatars are not entities; their
/// models are attached to the scene graph directly.
pub trait Avatar: fmt::Debug {
    fn name(&self) -> &str;

    fn model(&self) -> &dyn Model;

    /// World-space transform of the model: avatar placement times the
    /// configured model offset.
    fn transformation(&self) -> Transform;

    /// Place the avatar in world coordinates.
    fn set_transformation(&mut self, transform: Transform);

    fn is_visible(&self) -> bool;

    fn set_visible(&mut self, visible: bool);

    /// Advance animation state by `dt` seconds.
    fn update(&mut self, _dt: f32) {}
}

pub trait AvatarFactory {
    fn create(&self, config: &AvatarConfig) -> Option<Box<dyn Avatar>>;
}

/// Static model avatar.
#[derive(Debug)]
pub struct SimpleAvatar {
    name: String,
    model: Box<dyn Model>,
    model_offset: Transform,
    placement: Transform,
    visible: bool,
}

impl SimpleAvatar {
    pub fn new(name: impl Into<String>, model: Box<dyn Model>, model_offset: Transform) -> Self {
        Self {
            name: name.into(),
            model,
            model_offset,
            placement: Transform::IDENTITY,
            visible: true,
        }
    }
}

impl Avatar for SimpleAvatar {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    fn transformation(&self) -> Transform {
        self.placement * self.model_offset
    }

    fn set_transformation(&mut self, transform: Transform) {
        self.placement = transform;
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }
}

pub const SIMPLE_AVATAR_CLASS: &str = "SimpleAvatar";

#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleAvatarFactory;

impl AvatarFactory for SimpleAvatarFactory {
    fn create(&self, config: &AvatarConfig) -> Option<Box<dyn Avatar>> {
        if config.implementation_class != SIMPLE_AVATAR_CLASS {
            return None;
        }
        Some(Box::new(SimpleAvatar::new(
            config.name.clone(),
            Box::new(FileModel::from_config(&config.representation)),
            config.transform,
        )))
    }
}
