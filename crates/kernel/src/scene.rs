use glam::Vec3;
use std::cell::RefCell;
use std::rc::Rc;
use worldbase_common::Transform;

use crate::entity::Entity;
use crate::environment::Environment;
use crate::model::Model;
use crate::tile::Tile;

/// Render boundary. The world database calls these at lifecycle points
/// (add, remove, transform change) and works the same with no scene graph
/// installed.
///
/// Implementations only observe world state; they never mutate it.
pub trait SceneGraph {
    fn attach_environment(&mut self, env: &Environment);
    fn detach_environment(&mut self, env: &Environment);
    fn update_environment(&mut self, env: &Environment);
    fn show_environment(&mut self, env: &Environment, visible: bool);

    fn attach_entity(&mut self, entity: &Entity);
    fn detach_entity(&mut self, entity: &Entity);
    fn update_entity(&mut self, entity: &Entity);

    /// `placement` is relative to the environment.
    fn attach_tile(&mut self, env: &Environment, tile: &Tile, placement: &Transform);
    fn detach_tile(&mut self, env: &Environment, tile: &Tile);
    fn update_tile(&mut self, env: &Environment, tile: &Tile);

    /// Free-standing models (avatars, markers) in world space.
    fn attach_model(&mut self, model: &dyn Model, transform: &Transform);
    fn detach_model(&mut self, model: &dyn Model);
    fn show_model(&mut self, model: &dyn Model, visible: bool);

    /// Distance along the world-space ray at which `model`, placed at
    /// `transform`, is hit, if it is hit within `max_distance`.
    fn ray_intersect(
        &self,
        model: &dyn Model,
        transform: &Transform,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<f32>;
}

/// Scene graph shared by the database, its environments and entities.
pub type SharedSceneGraph = Rc<RefCell<dyn SceneGraph>>;

/// Run `f` against the scene graph if one is installed.
pub(crate) fn notify(scene: &Option<SharedSceneGraph>, f: impl FnOnce(&mut dyn SceneGraph)) {
    if let Some(sg) = scene {
        f(&mut *sg.borrow_mut());
    }
}
