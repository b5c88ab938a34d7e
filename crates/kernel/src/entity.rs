use std::any::Any;
use std::collections::HashMap;
use worldbase_common::{EntityTypeId, EnvironmentBasedId, EnvironmentId, Transform, TypeBasedId};

use crate::entity_type::EntityType;
use crate::model::{Model, clone_model};
use crate::scene::{SharedSceneGraph, notify};

/// Key under which another module stores per-entity data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentKey(pub u32);

/// Lifecycle stage of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Constructed by its type, not yet added to an environment.
    Created,
    InEnvironment(EnvironmentId),
}

/// Cached link to the environment an entity resides in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnvLink {
    pub id: EnvironmentId,
    pub world: Transform,
}

/// Creation/deletion completion handler, invoked at most once.
pub type EntityCallback = Box<dyn FnOnce(&Entity)>;

/// One live dynamic object.
///
/// The transform is relative to the environment the entity resides in.
/// `environment_based_id` records where it was created and never changes.
pub struct Entity {
    environment_based_id: EnvironmentBasedId,
    type_based_id: TypeBasedId,
    transform: Transform,
    fixed: bool,
    model: Option<Box<dyn Model>>,
    attachments: HashMap<AttachmentKey, Box<dyn Any>>,
    env: Option<EnvLink>,
    scene: Option<SharedSceneGraph>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("environment_based_id", &self.environment_based_id)
            .field("type_based_id", &self.type_based_id)
            .field("transform", &self.transform)
            .field("fixed", &self.fixed)
            .field("environment", &self.env.map(|l| l.id))
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

impl Entity {
    pub(crate) fn new(
        type_based_id: TypeBasedId,
        environment_based_id: EnvironmentBasedId,
        fixed: bool,
        model: Option<Box<dyn Model>>,
    ) -> Self {
        Self {
            environment_based_id,
            type_based_id,
            transform: Transform::IDENTITY,
            fixed,
            model,
            attachments: HashMap::new(),
            env: None,
            scene: None,
        }
    }

    pub fn environment_based_id(&self) -> EnvironmentBasedId {
        self.environment_based_id
    }

    pub fn type_based_id(&self) -> TypeBasedId {
        self.type_based_id
    }

    pub fn entity_type_id(&self) -> EntityTypeId {
        self.type_based_id.entity_type
    }

    pub fn instance_id(&self) -> u16 {
        self.type_based_id.instance
    }

    /// Environment the entity was created in.
    pub fn origin_environment_id(&self) -> EnvironmentId {
        self.environment_based_id.origin
    }

    /// Environment the entity currently resides in.
    pub fn environment_id(&self) -> Option<EnvironmentId> {
        self.env.map(|l| l.id)
    }

    pub fn state(&self) -> EntityState {
        match self.env {
            Some(link) => EntityState::InEnvironment(link.id),
            None => EntityState::Created,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    pub fn model(&self) -> Option<&dyn Model> {
        self.model.as_deref()
    }

    pub fn environment_transformation(&self) -> &Transform {
        &self.transform
    }

    pub fn set_environment_transformation(&mut self, transform: Transform) {
        self.transform = transform;
        self.update();
    }

    /// `environment * local`, or identity when the entity has no environment.
    pub fn world_transformation(&self) -> Transform {
        match self.env {
            Some(link) => link.world * self.transform,
            None => {
                tracing::warn!(
                    id = %self.environment_based_id,
                    "entity has no environment, returning identity"
                );
                Transform::IDENTITY
            }
        }
    }

    /// Store a world-space transform, subtracting the environment's X/Z offset.
    pub fn set_world_transformation(&mut self, mut transform: Transform) {
        match self.env {
            Some(link) => {
                transform.position.x -= link.world.position.x;
                transform.position.z -= link.world.position.z;
            }
            None => {
                tracing::warn!(
                    id = %self.environment_based_id,
                    "entity has no environment, storing transform unchanged"
                );
            }
        }
        self.set_environment_transformation(transform);
    }

    /// Notify the scene graph that the entity changed.
    pub fn update(&self) {
        notify(&self.scene, |sg| sg.update_entity(self));
    }

    /// Re-clone the visual representation from the type's current template.
    pub fn update_visual_representation(&mut self, entity_type: &EntityType) {
        notify(&self.scene, |sg| sg.detach_entity(self));
        self.model = entity_type.model().map(clone_model);
        notify(&self.scene, |sg| sg.attach_entity(self));
    }

    pub fn set_attachment<T: Any>(&mut self, key: AttachmentKey, value: T) -> Option<Box<dyn Any>> {
        self.attachments.insert(key, Box::new(value))
    }

    pub fn attachment<T: Any>(&self, key: AttachmentKey) -> Option<&T> {
        self.attachments.get(&key)?.downcast_ref()
    }

    pub fn attachment_mut<T: Any>(&mut self, key: AttachmentKey) -> Option<&mut T> {
        self.attachments.get_mut(&key)?.downcast_mut()
    }

    pub fn remove_attachment(&mut self, key: AttachmentKey) -> Option<Box<dyn Any>> {
        self.attachments.remove(&key)
    }

    pub(crate) fn link(&mut self, link: EnvLink, scene: Option<SharedSceneGraph>) {
        self.env = Some(link);
        self.scene = scene;
    }

    pub(crate) fn unlink(&mut self) -> Option<EnvLink> {
        self.scene = None;
        self.env.take()
    }

    pub(crate) fn set_link_world(&mut self, world: Transform) {
        if let Some(link) = self.env.as_mut() {
            link.world = world;
        }
    }

    pub(crate) fn set_scene(&mut self, scene: Option<SharedSceneGraph>) {
        self.scene = scene;
    }

    /// Shift the local position without notifying; used when the
    /// environment origin moves underneath the entity.
    pub(crate) fn offset_local_position(&mut self, dx: f32, dz: f32) {
        self.transform.position.x += dx;
        self.transform.position.z += dz;
    }

    pub(crate) fn store_transformation(&mut self, transform: Transform) {
        self.transform = transform;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn entity() -> Entity {
        Entity::new(TypeBasedId::new(1, 0), EnvironmentBasedId::new(2, 5), false, None)
    }

    #[test]
    fn fresh_entity_is_created_state() {
        let e = entity();
        assert_eq!(e.state(), EntityState::Created);
        assert_eq!(e.environment_id(), None);
        assert_eq!(e.origin_environment_id(), 2);
        assert_eq!(e.instance_id(), 0);
        assert_eq!(e.world_transformation(), Transform::IDENTITY);
    }

    #[test]
    fn world_transform_composes_environment() {
        let mut e = entity();
        e.link(
            EnvLink {
                id: 2,
                world: Transform::from_position(Vec3::new(100.0, 0.0, 200.0)),
            },
            None,
        );
        e.set_environment_transformation(Transform::from_position(Vec3::new(1.0, 2.0, 3.0)));
        let w = e.world_transformation();
        assert!(w.position.abs_diff_eq(Vec3::new(101.0, 2.0, 203.0), 1e-5));
        assert_eq!(e.state(), EntityState::InEnvironment(2));
    }

    #[test]
    fn set_world_subtracts_xz_offset() {
        let mut e = entity();
        e.link(
            EnvLink {
                id: 2,
                world: Transform::from_position(Vec3::new(100.0, 7.0, 200.0)),
            },
            None,
        );
        e.set_world_transformation(Transform::from_position(Vec3::new(150.0, 1.0, 250.0)));
        assert_eq!(
            e.environment_transformation().position,
            Vec3::new(50.0, 1.0, 50.0)
        );
    }

    #[test]
    fn attachments_are_typed() {
        let mut e = entity();
        let key = AttachmentKey(7);
        assert!(e.set_attachment(key, 42u32).is_none());
        assert_eq!(e.attachment::<u32>(key), Some(&42));
        assert!(e.attachment::<String>(key).is_none());
        *e.attachment_mut::<u32>(key).unwrap() += 1;
        assert_eq!(e.attachment::<u32>(key), Some(&43));
        assert!(e.remove_attachment(key).is_some());
        assert!(e.attachment::<u32>(AttachmentKey(7)).is_none());
    }
}
