use glam::Vec3;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use worldbase_common::{EnvironmentBasedId, EnvironmentId, TileId, Transform};
use worldbase_kernel::{Entity, Environment, Model, SceneGraph, SharedSceneGraph, Tile};

/// One call received through the scene-graph boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneCall {
    AttachEnvironment(EnvironmentId),
    DetachEnvironment(EnvironmentId),
    UpdateEnvironment(EnvironmentId),
    ShowEnvironment(EnvironmentId, bool),
    AttachEntity(EnvironmentBasedId),
    DetachEntity(EnvironmentBasedId),
    UpdateEntity(EnvironmentBasedId),
    AttachTile {
        environment: EnvironmentId,
        tile: TileId,
        placement: Transform,
    },
    DetachTile {
        environment: EnvironmentId,
        tile: TileId,
    },
    UpdateTile {
        environment: EnvironmentId,
        tile: TileId,
    },
    AttachModel(String),
    DetachModel(String),
    ShowModel(String, bool),
}

/// Scene graph that records what the world database tells it and keeps
/// the set of currently attached nodes.
///
/// Ray tests treat every model as a sphere of `hit_radius` around its
/// transform's position, scaled by the largest scale component.
#[derive(Debug)]
pub struct RecordingSceneGraph {
    calls: Vec<SceneCall>,
    hit_radius: f32,
    environments: BTreeSet<EnvironmentId>,
    hidden_environments: BTreeSet<EnvironmentId>,
    entities: BTreeSet<EnvironmentBasedId>,
    tiles: usize,
}

impl Default for RecordingSceneGraph {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RecordingSceneGraph {
    pub fn new(hit_radius: f32) -> Self {
        Self {
            calls: Vec::new(),
            hit_radius,
            environments: BTreeSet::new(),
            hidden_environments: BTreeSet::new(),
            entities: BTreeSet::new(),
            tiles: 0,
        }
    }

    /// The recorder plus the same instance as a handle the database accepts.
    pub fn shared(hit_radius: f32) -> (Rc<RefCell<Self>>, SharedSceneGraph) {
        let recorder = Rc::new(RefCell::new(Self::new(hit_radius)));
        let shared: SharedSceneGraph = recorder.clone();
        (recorder, shared)
    }

    pub fn calls(&self) -> &[SceneCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<SceneCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn attached_environments(&self) -> impl Iterator<Item = EnvironmentId> + '_ {
        self.environments.iter().copied()
    }

    pub fn attached_entities(&self) -> impl Iterator<Item = EnvironmentBasedId> + '_ {
        self.entities.iter().copied()
    }

    pub fn attached_tile_count(&self) -> usize {
        self.tiles
    }

    pub fn is_environment_shown(&self, id: EnvironmentId) -> bool {
        self.environments.contains(&id) && !self.hidden_environments.contains(&id)
    }

    fn record(&mut self, call: SceneCall) {
        tracing::trace!(?call, "scene call");
        self.calls.push(call);
    }
}

/// Nearest non-negative distance at which the ray meets the sphere.
fn ray_sphere(origin: Vec3, direction: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let dir = direction.try_normalize()?;
    let to_center = center - origin;
    let along = to_center.dot(dir);
    let miss_sq = to_center.length_squared() - along * along;
    let radius_sq = radius * radius;
    if miss_sq > radius_sq {
        return None;
    }
    let half_chord = (radius_sq - miss_sq).sqrt();
    let near = along - half_chord;
    let far = along + half_chord;
    if near >= 0.0 {
        Some(near)
    } else if far >= 0.0 {
        Some(0.0)
    } else {
        None
    }
}

impl SceneGraph for RecordingSceneGraph {
    fn attach_environment(&mut self, env: &Environment) {
        self.environments.insert(env.id());
        self.record(SceneCall::AttachEnvironment(env.id()));
    }

    fn detach_environment(&mut self, env: &Environment) {
        self.environments.remove(&env.id());
        self.hidden_environments.remove(&env.id());
        self.record(SceneCall::DetachEnvironment(env.id()));
    }

    fn update_environment(&mut self, env: &Environment) {
        self.record(SceneCall::UpdateEnvironment(env.id()));
    }

    fn show_environment(&mut self, env: &Environment, visible: bool) {
        if visible {
            self.hidden_environments.remove(&env.id());
        } else {
            self.hidden_environments.insert(env.id());
        }
        self.record(SceneCall::ShowEnvironment(env.id(), visible));
    }

    fn attach_entity(&mut self, entity: &Entity) {
        self.entities.insert(entity.environment_based_id());
        self.record(SceneCall::AttachEntity(entity.environment_based_id()));
    }

    fn detach_entity(&mut self, entity: &Entity) {
        self.entities.remove(&entity.environment_based_id());
        self.record(SceneCall::DetachEntity(entity.environment_based_id()));
    }

    fn update_entity(&mut self, entity: &Entity) {
        self.record(SceneCall::UpdateEntity(entity.environment_based_id()));
    }

    fn attach_tile(&mut self, env: &Environment, tile: &Tile, placement: &Transform) {
        self.tiles += 1;
        self.record(SceneCall::AttachTile {
            environment: env.id(),
            tile: tile.id(),
            placement: *placement,
        });
    }

    fn detach_tile(&mut self, env: &Environment, tile: &Tile) {
        self.tiles = self.tiles.saturating_sub(1);
        self.record(SceneCall::DetachTile {
            environment: env.id(),
            tile: tile.id(),
        });
    }

    fn update_tile(&mut self, env: &Environment, tile: &Tile) {
        self.record(SceneCall::UpdateTile {
            environment: env.id(),
            tile: tile.id(),
        });
    }

    fn attach_model(&mut self, model: &dyn Model, _transform: &Transform) {
        self.record(SceneCall::AttachModel(model.source().to_string()));
    }

    fn detach_model(&mut self, model: &dyn Model) {
        self.record(SceneCall::DetachModel(model.source().to_string()));
    }

    fn show_model(&mut self, model: &dyn Model, visible: bool) {
        self.record(SceneCall::ShowModel(model.source().to_string(), visible));
    }

    fn ray_intersect(
        &self,
        _model: &dyn Model,
        transform: &Transform,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<f32> {
        let radius = self.hit_radius * transform.scale.max_element();
        ray_sphere(origin, direction, transform.position, radius).filter(|d| *d <= max_distance)
    }
}
