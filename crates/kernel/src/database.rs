use glam::Vec3;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use worldbase_common::{
    EntityTypeId, EnvironmentBasedId, EnvironmentId, IdPool, IdPoolRegistry, TileId, Transform,
    TypeBasedId,
};
use worldbase_config::{AvatarConfig, EnvironmentLayoutConfig};

use crate::entity::{Entity, EntityCallback};
use crate::entity_type::EntityType;
use crate::environment::Environment;
use crate::error::WorldError;
use crate::events::{
    CreateEntityEvent, CreateEnvironmentEvent, DestroyEntityEvent, EventQueue, ExecutionScope,
    NetMessage, ReloadEnvironmentsEvent, WorldEvent,
};
use crate::factory::{
    Avatar, AvatarFactory, DefaultEntityTypeFactory, EntityTypeFactory, SimpleAvatarFactory,
};
use crate::grid::GridSpacing;
use crate::model::Model;
use crate::pools::PoolOwner;
use crate::scene::{SharedSceneGraph, notify};
use crate::tile::Tile;

mod loader;

/// Handle of a loaded avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AvatarHandle(u32);

/// Where `reload_environments` re-reads the layout from.
#[derive(Debug, Clone)]
enum LayoutSource {
    File(PathBuf),
    Inline {
        layout: EnvironmentLayoutConfig,
        base_dir: Option<PathBuf>,
    },
}

/// Environment currently holding entity `id`: the origin's index first,
/// then a scan.
fn locate(
    envs: &BTreeMap<EnvironmentId, Environment>,
    id: EnvironmentBasedId,
) -> Option<EnvironmentId> {
    let indexed = envs
        .get(&id.origin)
        .and_then(|origin| origin.originated_entity_location(id.local))
        .filter(|at| envs.get(at).is_some_and(|env| env.contains_entity(id)));
    indexed.or_else(|| {
        envs.values()
            .find(|env| env.contains_entity(id))
            .map(Environment::id)
    })
}

/// The world model of one peer: entity types, tile masters, environments,
/// the shared grid spacing, factories and the event outbox.
///
/// Public mutators for entities and environments only build and dispatch
/// events; the world changes when `process_events` or `receive` executes them.
pub struct WorldDatabase {
    spacing: GridSpacing,
    entity_types: BTreeMap<EntityTypeId, EntityType>,
    tiles: BTreeMap<TileId, Tile>,
    environments: BTreeMap<EnvironmentId, Environment>,
    pool_registry: IdPoolRegistry<PoolOwner>,
    entity_type_factories: Vec<Box<dyn EntityTypeFactory>>,
    avatar_factories: Vec<Box<dyn AvatarFactory>>,
    avatars: BTreeMap<AvatarHandle, Box<dyn Avatar>>,
    next_avatar: u32,
    layout_source: Option<LayoutSource>,
    outbox: EventQueue,
    scene: Option<SharedSceneGraph>,
    peer_slot: u16,
}

impl Default for WorldDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorldDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldDatabase")
            .field("spacing", &self.spacing)
            .field("entity_types", &self.entity_types.len())
            .field("tiles", &self.tiles.len())
            .field("environments", &self.environments.len())
            .field("avatars", &self.avatars.len())
            .field("pending_events", &self.outbox.len())
            .field("peer_slot", &self.peer_slot)
            .finish()
    }
}

impl WorldDatabase {
    /// Empty database with the built-in entity type and avatar factories.
    pub fn new() -> Self {
        let mut db = Self {
            spacing: GridSpacing::default(),
            entity_types: BTreeMap::new(),
            tiles: BTreeMap::new(),
            environments: BTreeMap::new(),
            pool_registry: IdPoolRegistry::new(),
            entity_type_factories: Vec::new(),
            avatar_factories: Vec::new(),
            avatars: BTreeMap::new(),
            next_avatar: 0,
            layout_source: None,
            outbox: EventQueue::new(),
            scene: None,
            peer_slot: 0,
        };
        db.register_entity_type_factory(Box::new(DefaultEntityTypeFactory));
        db.register_avatar_factory(Box::new(SimpleAvatarFactory));
        db
    }

    /// Select which runtime id chunk this peer carves in every entity type
    /// and environment. Peers sharing a world should use distinct slots.
    pub fn with_peer_slot(mut self, slot: u16) -> Self {
        self.set_peer_slot(slot);
        self
    }

    pub fn peer_slot(&self) -> u16 {
        self.peer_slot
    }

    /// Applies to pools not carved yet, including those of existing types
    /// and environments.
    pub fn set_peer_slot(&mut self, slot: u16) {
        self.peer_slot = slot;
        for entity_type in self.entity_types.values_mut() {
            entity_type.set_peer_slot(slot);
        }
        for env in self.environments.values_mut() {
            env.set_peer_slot(slot);
        }
    }

    pub fn with_scene_graph(mut self, scene: SharedSceneGraph) -> Self {
        self.set_scene_graph(Some(scene));
        self
    }

    pub fn scene_graph(&self) -> Option<&SharedSceneGraph> {
        self.scene.as_ref()
    }

    /// Install or remove the scene graph, moving every environment and
    /// avatar over to it.
    pub fn set_scene_graph(&mut self, scene: Option<SharedSceneGraph>) {
        for avatar in self.avatars.values() {
            notify(&self.scene, |sg| sg.detach_model(avatar.model()));
        }
        self.scene = scene;
        for env in self.environments.values_mut() {
            env.set_scene_graph(self.scene.clone());
        }
        for avatar in self.avatars.values() {
            notify(&self.scene, |sg| {
                sg.attach_model(avatar.model(), &avatar.transformation());
                if !avatar.is_visible() {
                    sg.show_model(avatar.model(), false);
                }
            });
        }
    }

    /// Drop all world state and pending events. Factories stay registered.
    pub fn clear_world(&mut self) {
        for env in self.environments.values_mut() {
            env.detach_from_scene();
            env.take_entities();
        }
        for ty in self.entity_types.values_mut() {
            ty.clear_instances();
        }
        for avatar in self.avatars.values() {
            notify(&self.scene, |sg| sg.detach_model(avatar.model()));
        }
        self.environments.clear();
        self.entity_types.clear();
        self.tiles.clear();
        self.avatars.clear();
        self.pool_registry.clear();
        self.outbox.clear();
        self.layout_source = None;
        tracing::info!("world cleared");
    }

    /// Clear the world and unregister every factory.
    pub fn shutdown(&mut self) {
        self.clear_world();
        self.entity_type_factories.clear();
        self.avatar_factories.clear();
        self.scene = None;
        tracing::info!("world database shut down");
    }

    pub fn spacing(&self) -> GridSpacing {
        self.spacing
    }

    /// Set the grid spacing shared by all environments. Only possible
    /// while no environment exists.
    pub fn set_spacing(&mut self, x: u32, z: u32) -> Result<(), WorldError> {
        if x == 0 || z == 0 {
            return Err(WorldError::InvalidSpacing { x, z });
        }
        let spacing = GridSpacing::new(x, z);
        if spacing == self.spacing {
            return Ok(());
        }
        if !self.environments.is_empty() {
            tracing::error!(
                ?spacing,
                current = ?self.spacing,
                "spacing change with environments present"
            );
            return Err(WorldError::SpacingLocked);
        }
        self.spacing = spacing;
        Ok(())
    }

    pub fn register_entity_type_factory(&mut self, factory: Box<dyn EntityTypeFactory>) {
        self.entity_type_factories.push(factory);
    }

    pub fn register_avatar_factory(&mut self, factory: Box<dyn AvatarFactory>) {
        self.avatar_factories.push(factory);
    }

    pub fn add_entity_type(&mut self, mut entity_type: EntityType) -> Result<(), WorldError> {
        let id = entity_type.id();
        if self.entity_types.contains_key(&id) {
            tracing::error!(id, "entity type id already in use");
            return Err(WorldError::EntityTypeIdInUse(id));
        }
        if let Some(name) = entity_type.global_entity_id_pool_name() {
            self.pool_registry.register(name, PoolOwner::EntityType(id));
        }
        tracing::debug!(id, name = entity_type.name(), "entity type added");
        entity_type.set_peer_slot(self.peer_slot);
        self.entity_types.insert(id, entity_type);
        Ok(())
    }

    /// Destroy every instance of the type locally, then remove it.
    pub fn delete_entity_type(&mut self, id: EntityTypeId) -> Result<EntityType, WorldError> {
        let instances: Vec<EnvironmentBasedId> = self
            .entity_types
            .get(&id)
            .ok_or(WorldError::UnknownEntityType(id))?
            .instances()
            .iter()
            .map(|r| r.environment_based_id)
            .collect();
        for instance in instances {
            self.dispose_entity(instance, true);
        }
        let entity_type = self
            .entity_types
            .remove(&id)
            .ok_or(WorldError::UnknownEntityType(id))?;
        if let Some(name) = entity_type.global_entity_id_pool_name() {
            self.pool_registry.unregister(name);
        }
        tracing::info!(id, name = entity_type.name(), "entity type deleted");
        Ok(entity_type)
    }

    pub fn entity_type(&self, id: EntityTypeId) -> Option<&EntityType> {
        let found = self.entity_types.get(&id);
        if found.is_none() {
            tracing::warn!(id, "entity type not found");
        }
        found
    }

    pub fn entity_type_mut(&mut self, id: EntityTypeId) -> Option<&mut EntityType> {
        let found = self.entity_types.get_mut(&id);
        if found.is_none() {
            tracing::warn!(id, "entity type not found");
        }
        found
    }

    pub fn entity_type_by_name(&self, name: &str) -> Option<&EntityType> {
        let found = self.entity_types.values().find(|t| t.name() == name);
        if found.is_none() {
            tracing::warn!(name, "entity type not found");
        }
        found
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entity_types.values()
    }

    /// Replace a type's template and re-clone it into every instance.
    pub fn set_entity_type_model(
        &mut self,
        id: EntityTypeId,
        model: Option<Box<dyn Model>>,
    ) -> Result<(), WorldError> {
        let entity_type = self
            .entity_types
            .get_mut(&id)
            .ok_or(WorldError::UnknownEntityType(id))?;
        entity_type.set_model(model);
        for record in entity_type.instances() {
            let id = record.environment_based_id;
            let entity = locate(&self.environments, id)
                .and_then(|at| self.environments.get_mut(&at))
                .and_then(|env| env.entity_by_environment_based_id_mut(id));
            match entity {
                Some(entity) => entity.update_visual_representation(entity_type),
                None => tracing::error!(%id, "instance of entity type is not resident anywhere"),
            }
        }
        Ok(())
    }

    pub fn add_tile(&mut self, tile: Tile) -> Result<(), WorldError> {
        if self.tiles.contains_key(&tile.id()) {
            tracing::error!(id = tile.id(), "tile id already in use");
            return Err(WorldError::TileIdInUse(tile.id()));
        }
        self.tiles.insert(tile.id(), tile);
        Ok(())
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        let found = self.tiles.get(&id);
        if found.is_none() {
            tracing::warn!(id, "tile not found");
        }
        found
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn environment(&self, id: EnvironmentId) -> Option<&Environment> {
        let found = self.environments.get(&id);
        if found.is_none() {
            tracing::warn!(id, "environment not found");
        }
        found
    }

    pub fn environment_mut(&mut self, id: EnvironmentId) -> Option<&mut Environment> {
        let found = self.environments.get_mut(&id);
        if found.is_none() {
            tracing::warn!(id, "environment not found");
        }
        found
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn environment_at_world_position(&self, position: Vec3) -> Option<&Environment> {
        let found = self
            .environments
            .values()
            .find(|env| env.contains_world_position(position));
        if found.is_none() {
            tracing::warn!(?position, "no environment at world position");
        }
        found
    }

    /// Validate and dispatch the creation of an empty environment. `x`/`z`
    /// are world units; `x_size`/`z_size` are grid cells.
    pub fn create_environment(
        &mut self,
        id: EnvironmentId,
        x: i32,
        z: i32,
        x_size: u32,
        z_size: u32,
    ) -> Result<(), WorldError> {
        if self.environments.contains_key(&id) {
            tracing::warn!(id, "environment id already in use");
            return Err(WorldError::EnvironmentIdInUse(id));
        }
        let spacing = self.spacing;
        if x.rem_euclid(spacing.x as i32) != 0 || z.rem_euclid(spacing.z as i32) != 0 {
            tracing::warn!(x, z, ?spacing, "environment position not on the grid");
            return Err(WorldError::MisalignedPosition {
                x,
                z,
                x_spacing: spacing.x,
                z_spacing: spacing.z,
            });
        }
        if x_size == 0 || z_size == 0 {
            return Err(WorldError::InvalidConfig(format!(
                "environment {id} size must be positive, got {x_size}x{z_size}"
            )));
        }
        let min_x = x as i64;
        let min_z = z as i64;
        let max_x = min_x + x_size as i64 * spacing.x as i64;
        let max_z = min_z + z_size as i64 * spacing.z as i64;
        if let Some(other) = self.environments.values().find(|env| {
            let (o_min_x, o_min_z, o_max_x, o_max_z) = env.world_bounds();
            !(max_x <= o_min_x || min_x >= o_max_x || max_z <= o_min_z || min_z >= o_max_z)
        }) {
            tracing::warn!(id, other = other.id(), "environment would overlap");
            return Err(WorldError::EnvironmentOverlap {
                id,
                other: other.id(),
            });
        }
        self.send_event(
            CreateEnvironmentEvent {
                id,
                x_position: x / spacing.x as i32,
                z_position: z / spacing.z as i32,
                x_size,
                z_size,
            }
            .into(),
            ExecutionScope::Global,
        );
        Ok(())
    }

    fn insert_environment(&mut self, mut env: Environment) {
        let id = env.id();
        self.pool_registry
            .register(env.global_entity_id_pool_name(), PoolOwner::Environment(id));
        env.set_scene_graph(self.scene.clone());
        env.set_peer_slot(self.peer_slot);
        self.environments.insert(id, env);
    }

    /// Resolve a registered pool name to the namespace's global pool.
    pub fn id_pool(&self, name: &str) -> Option<&IdPool> {
        match self.pool_registry.lookup(name)? {
            PoolOwner::EntityType(id) => self.entity_types.get(id).map(|t| t.id_pools().global()),
            PoolOwner::Environment(id) => self.environments.get(id).map(|e| e.id_pools().global()),
        }
    }

    pub fn id_pool_names(&self) -> impl Iterator<Item = &str> {
        self.pool_registry.names()
    }

    pub fn entity_with_environment_id(&self, id: EnvironmentBasedId) -> Option<&Entity> {
        let found = locate(&self.environments, id)
            .and_then(|at| self.environments.get(&at))
            .and_then(|env| env.entity_by_environment_based_id(id));
        if found.is_none() {
            tracing::warn!(%id, "entity not found");
        }
        found
    }

    pub fn entity_with_environment_id_mut(
        &mut self,
        id: EnvironmentBasedId,
    ) -> Option<&mut Entity> {
        let found = locate(&self.environments, id)
            .and_then(|at| self.environments.get_mut(&at))
            .and_then(|env| env.entity_by_environment_based_id_mut(id));
        if found.is_none() {
            tracing::warn!(%id, "entity not found");
        }
        found
    }

    pub fn entity_with_type_instance_id(&self, id: TypeBasedId) -> Option<&Entity> {
        self.entity_type(id.entity_type)?
            .entity_by_instance_id(id.instance)
            .and_then(|env_based| self.entity_with_environment_id(env_based))
    }

    fn contains_entity(&self, id: EnvironmentBasedId) -> bool {
        locate(&self.environments, id).is_some()
    }

    /// Dispatch the creation of an entity of `type_id` in `env_id`. The
    /// returned id is valid immediately; the entity exists once the event
    /// has executed, at which point `callback` runs.
    pub fn create_entity(
        &mut self,
        type_id: EntityTypeId,
        env_id: EnvironmentId,
        transform: Transform,
        callback: Option<EntityCallback>,
    ) -> Result<EnvironmentBasedId, WorldError> {
        let entity_type = self
            .entity_types
            .get_mut(&type_id)
            .ok_or(WorldError::UnknownEntityType(type_id))?;
        let env = self
            .environments
            .get_mut(&env_id)
            .ok_or(WorldError::UnknownEnvironment(env_id))?;
        let event = env.create_entity(entity_type, transform, callback)?;
        let id = event.environment_based_id;
        self.send_event(event.into(), ExecutionScope::Global);
        Ok(id)
    }

    /// Dispatch the destruction of an entity. `callback` is kept by the
    /// entity's origin environment and runs when the event executes.
    pub fn destroy_entity(
        &mut self,
        id: EnvironmentBasedId,
        callback: Option<EntityCallback>,
    ) -> Result<(), WorldError> {
        if !self.contains_entity(id) {
            tracing::warn!(%id, "destroy of unknown entity");
            return Err(WorldError::UnknownEntity(id));
        }
        let origin = self
            .environments
            .get_mut(&id.origin)
            .ok_or(WorldError::UnknownEnvironment(id.origin))?;
        let event = origin.destroy_entity(id, callback)?;
        self.send_event(event.into(), ExecutionScope::Global);
        Ok(())
    }

    pub fn unregister_entity_creation_callback(&mut self, id: EnvironmentBasedId) -> bool {
        self.environments
            .get_mut(&id.origin)
            .is_some_and(|env| env.unregister_entity_creation_callback(id))
    }

    pub fn unregister_entity_deletion_callback(&mut self, id: EnvironmentBasedId) -> bool {
        self.environments
            .get_mut(&id.origin)
            .is_some_and(|env| env.unregister_entity_deletion_callback(id))
    }

    /// Move an entity into another environment, keeping its world transform.
    pub fn change_environment(
        &mut self,
        id: EnvironmentBasedId,
        new_env_id: EnvironmentId,
    ) -> Result<(), WorldError> {
        let new_world = self
            .environments
            .get(&new_env_id)
            .ok_or(WorldError::UnknownEnvironment(new_env_id))?
            .world_transformation();
        let current = locate(&self.environments, id).ok_or(WorldError::UnknownEntity(id))?;
        if current == new_env_id {
            return Ok(());
        }
        let old_env = self
            .environments
            .get_mut(&current)
            .ok_or(WorldError::UnknownEnvironment(current))?;
        let old_world = old_env
            .entity_by_environment_based_id(id)
            .ok_or(WorldError::NotResident { id, env: current })?
            .world_transformation();
        let old_local = *old_env
            .entity_by_environment_based_id(id)
            .ok_or(WorldError::NotResident { id, env: current })?
            .environment_transformation();
        let mut entity = old_env
            .remove_entity(id)
            .ok_or(WorldError::NotResident { id, env: current })?;

        entity.store_transformation(new_world.inverse() * old_world);
        let new_env = self
            .environments
            .get_mut(&new_env_id)
            .ok_or(WorldError::UnknownEnvironment(new_env_id))?;
        if let Err(mut entity) = new_env.add_entity(entity) {
            entity.store_transformation(old_local);
            if let Some(old_env) = self.environments.get_mut(&current) {
                if old_env.add_entity(entity).is_err() {
                    tracing::error!(%id, "entity lost while changing environment");
                }
            }
            return Err(WorldError::DuplicateEntity(id));
        }
        if let Some(origin) = self.environments.get_mut(&id.origin) {
            origin.record_originated(id.local, new_env_id);
        }
        if let Some(entity) = self
            .environments
            .get(&new_env_id)
            .and_then(|env| env.entity_by_environment_based_id(id))
        {
            entity.update();
        }
        tracing::debug!(%id, from = current, to = new_env_id, "entity changed environment");
        Ok(())
    }

    /// Remove an entity from its environment and its type, release its ids
    /// and drop it. Returns whether it existed.
    fn dispose_entity(&mut self, id: EnvironmentBasedId, fire_callback: bool) -> bool {
        let Some(entity) = locate(&self.environments, id)
            .and_then(|at| self.environments.get_mut(&at))
            .and_then(|env| env.remove_entity(id))
        else {
            return false;
        };
        match self.entity_types.get_mut(&entity.entity_type_id()) {
            Some(entity_type) => {
                entity_type.remove_instance(entity.type_based_id());
            }
            None => tracing::error!(
                %id,
                entity_type = entity.entity_type_id(),
                "entity type of disposed entity missing"
            ),
        }
        if let Some(origin) = self.environments.get_mut(&id.origin) {
            origin.remove_deleted_entity(&entity, fire_callback);
        }
        tracing::debug!(%id, "entity disposed");
        true
    }

    pub fn load_avatar(&mut self, config: &AvatarConfig) -> Result<AvatarHandle, WorldError> {
        let avatar = self
            .avatar_factories
            .iter()
            .find_map(|f| f.create(config))
            .ok_or_else(|| WorldError::NoAvatarFactory(config.implementation_class.clone()))?;
        notify(&self.scene, |sg| {
            sg.attach_model(avatar.model(), &avatar.transformation())
        });
        let handle = AvatarHandle(self.next_avatar);
        self.next_avatar += 1;
        tracing::info!(name = avatar.name(), ?handle, "avatar loaded");
        self.avatars.insert(handle, avatar);
        Ok(handle)
    }

    pub fn load_avatar_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<AvatarHandle, WorldError> {
        let config = worldbase_config::load_avatar(path)?;
        self.load_avatar(&config)
    }

    /// Detach the avatar's model and hand the avatar back.
    pub fn remove_avatar(&mut self, handle: AvatarHandle) -> Option<Box<dyn Avatar>> {
        let avatar = self.avatars.remove(&handle)?;
        notify(&self.scene, |sg| sg.detach_model(avatar.model()));
        Some(avatar)
    }

    pub fn avatar(&self, handle: AvatarHandle) -> Option<&dyn Avatar> {
        self.avatars.get(&handle).map(|a| a.as_ref())
    }

    pub fn avatar_mut(&mut self, handle: AvatarHandle) -> Option<&mut (dyn Avatar + 'static)> {
        self.avatars.get_mut(&handle).map(|a| a.as_mut())
    }

    pub fn show_avatar(&mut self, handle: AvatarHandle, visible: bool) -> bool {
        let Some(avatar) = self.avatars.get_mut(&handle) else {
            return false;
        };
        avatar.set_visible(visible);
        notify(&self.scene, |sg| sg.show_model(avatar.model(), visible));
        true
    }

    pub fn update_avatars(&mut self, dt: f32) {
        for avatar in self.avatars.values_mut() {
            avatar.update(dt);
        }
    }

    /// Queue an event for `process_events`.
    pub fn send_event(&mut self, event: WorldEvent, scope: ExecutionScope) {
        self.outbox.push(event, scope);
    }

    pub fn pending_events(&self) -> &EventQueue {
        &self.outbox
    }

    /// Drain the outbox: execute local events in order and return the
    /// encoded messages for other peers. Events queued while executing are
    /// processed in the same call. A failing event is logged and skipped.
    pub fn process_events(&mut self) -> Result<Vec<NetMessage>, WorldError> {
        let mut outgoing = Vec::new();
        while let Some((event, scope)) = self.outbox.pop() {
            if scope.sends_remotely() {
                outgoing.push(event.encode()?);
            }
            if scope.executes_locally() {
                if let Err(err) = event.execute(self) {
                    tracing::warn!(event = event.name(), %err, "event execution refused");
                    if let WorldEvent::CreateEntity(create) = &event {
                        self.abandon_creation(create);
                    }
                }
            }
        }
        Ok(outgoing)
    }

    /// Undo the bookkeeping of a locally dispatched creation that failed:
    /// the callback never fires and ids nothing uses are recycled.
    fn abandon_creation(&mut self, event: &CreateEntityEvent) {
        let id = event.environment_based_id;
        let exists = self.contains_entity(id);
        if let Some(env) = self.environments.get_mut(&id.origin) {
            env.abandon_creation(id, !exists);
        }
        let type_id = event.type_based_id.entity_type;
        if let Some(entity_type) = self.entity_types.get_mut(&type_id) {
            entity_type.release_unused_instance_id(event.type_based_id.instance);
        }
    }

    /// Decode and execute an event sent by another peer.
    pub fn receive(&mut self, message: &NetMessage) -> Result<(), WorldError> {
        let event = WorldEvent::decode(message)?;
        tracing::debug!(event = event.name(), "remote event received");
        event.execute(self)
    }

    /// Dispatch a local reload of every environment from the stored layout.
    pub fn reload_environments(&mut self) {
        self.send_event(ReloadEnvironmentsEvent.into(), ExecutionScope::Local);
    }

    /// Build the entity an event describes. Ids issued by another peer are
    /// recorded in the origin environment and the type so this peer never
    /// issues them again.
    pub(crate) fn apply_create_entity(
        &mut self,
        event: &CreateEntityEvent,
    ) -> Result<(), WorldError> {
        let id = event.environment_based_id;
        if self.contains_entity(id) {
            tracing::warn!(%id, "entity already exists, creation ignored");
            return Err(WorldError::DuplicateEntity(id));
        }
        let type_based_id = event.type_based_id;
        let entity_type = self
            .entity_types
            .get_mut(&type_based_id.entity_type)
            .ok_or(WorldError::UnknownEntityType(type_based_id.entity_type))?;
        let env = self
            .environments
            .get_mut(&id.origin)
            .ok_or(WorldError::UnknownEnvironment(id.origin))?;
        let mut entity = entity_type.create_instance_unchecked(type_based_id.instance, id)?;
        entity.store_transformation(event.transform);
        if let Err(entity) = env.add_new_entity(entity) {
            entity_type.remove_instance(entity.type_based_id());
            return Err(WorldError::DuplicateEntity(id));
        }
        env.record_remote_entity_id(id.local);
        entity_type.record_remote_instance_id(type_based_id.instance);
        tracing::debug!(%id, %type_based_id, "entity created");
        Ok(())
    }

    pub(crate) fn apply_destroy_entity(
        &mut self,
        event: &DestroyEntityEvent,
    ) -> Result<(), WorldError> {
        let id = event.environment_based_id;
        if !self.dispose_entity(id, true) {
            tracing::warn!(%id, "destroy of unknown entity ignored");
        }
        Ok(())
    }

    pub(crate) fn apply_create_environment(
        &mut self,
        event: &CreateEnvironmentEvent,
    ) -> Result<(), WorldError> {
        if self.environments.contains_key(&event.id) {
            tracing::warn!(id = event.id, "environment already exists, creation ignored");
            return Err(WorldError::EnvironmentIdInUse(event.id));
        }
        let env = Environment::new(
            event.id,
            event.x_position,
            event.z_position,
            event.x_size,
            event.z_size,
            self.spacing,
        );
        self.insert_environment(env);
        tracing::info!(
            id = event.id,
            x = event.x_position,
            z = event.z_position,
            "environment created"
        );
        Ok(())
    }

    /// Text description of the whole database.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "WorldDatabase: spacing {}x{}, {} entity types, {} tiles, {} environments, {} avatars",
            self.spacing.x,
            self.spacing.z,
            self.entity_types.len(),
            self.tiles.len(),
            self.environments.len(),
            self.avatars.len()
        );
        for ty in self.entity_types.values() {
            out.push_str(&ty.dump());
        }
        for tile in self.tiles.values() {
            out.push_str(&tile.dump());
            out.push('\n');
        }
        for env in self.environments.values() {
            out.push_str(&env.dump());
        }
        tracing::debug!("{out}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::testing::{Call, CallLog};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn db_with_envs() -> WorldDatabase {
        let mut db = WorldDatabase::new();
        db.add_entity_type(EntityType::new(1, "ball")).unwrap();
        db.create_environment(1, 0, 0, 5, 5).unwrap();
        db.create_environment(2, 500, 0, 5, 5).unwrap();
        db.process_events().unwrap();
        db
    }

    fn spawn(db: &mut WorldDatabase, env: EnvironmentId, position: Vec3) -> EnvironmentBasedId {
        let id = db
            .create_entity(1, env, Transform::from_position(position), None)
            .unwrap();
        db.process_events().unwrap();
        id
    }

    #[test]
    fn create_environment_validation() {
        let mut db = WorldDatabase::new();
        db.create_environment(1, 0, 0, 5, 5).unwrap();
        db.process_events().unwrap();
        assert!(db.environment(1).is_some());

        assert!(matches!(
            db.create_environment(1, 1000, 1000, 5, 5),
            Err(WorldError::EnvironmentIdInUse(1))
        ));
        assert!(matches!(
            db.create_environment(2, 550, 0, 5, 5),
            Err(WorldError::MisalignedPosition { .. })
        ));
        assert!(matches!(
            db.create_environment(2, 0, 0, 5, 5),
            Err(WorldError::EnvironmentOverlap { id: 2, other: 1 })
        ));
        assert!(matches!(
            db.create_environment(2, 400, 400, 5, 5),
            Err(WorldError::EnvironmentOverlap { .. })
        ));
        assert!(db.pending_events().is_empty());
        assert_eq!(db.environments().count(), 1);

        db.create_environment(2, 500, 500, 5, 5).unwrap();
        db.create_environment(3, -500, 0, 5, 5).unwrap();
        db.process_events().unwrap();
        assert_eq!(db.environments().count(), 3);
        assert_eq!(db.environment(3).unwrap().x_position(), -5);
    }

    #[test]
    fn create_environment_is_global() {
        let mut db = WorldDatabase::new();
        db.create_environment(4, 200, 300, 2, 2).unwrap();
        let messages = db.process_events().unwrap();
        assert_eq!(messages.len(), 1);

        let mut peer = WorldDatabase::new();
        peer.receive(&messages[0]).unwrap();
        let env = peer.environment(4).unwrap();
        assert_eq!((env.x_position(), env.z_position()), (2, 3));
        assert!(matches!(
            peer.receive(&messages[0]),
            Err(WorldError::EnvironmentIdInUse(4))
        ));
    }

    #[test]
    fn pending_creation_runs_callback_once() {
        let mut db = db_with_envs();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let id = db
            .create_entity(
                1,
                1,
                Transform::IDENTITY,
                Some(Box::new(move |e: &Entity| sink.borrow_mut().push(e.environment_based_id()))),
            )
            .unwrap();
        assert!(db.entity_with_environment_id(id).is_none());
        let (event, _) = db.pending_events().iter().next().cloned().unwrap();

        db.process_events().unwrap();
        assert_eq!(*calls.borrow(), vec![id]);
        assert!(db.entity_with_environment_id(id).is_some());

        assert!(matches!(event.execute(&mut db), Err(WorldError::DuplicateEntity(_))));
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(db.entity_type(1).unwrap().instance_count(), 1);
    }

    #[test]
    fn destruction_removes_from_both_indices() {
        let mut db = db_with_envs();
        let id = spawn(&mut db, 1, Vec3::ZERO);
        let type_based = db.entity_with_environment_id(id).unwrap().type_based_id();
        let deleted = Rc::new(Cell::new(0));
        let seen = deleted.clone();
        db.destroy_entity(id, Some(Box::new(move |_: &Entity| seen.set(seen.get() + 1))))
            .unwrap();
        assert!(db.entity_with_environment_id(id).is_some());
        db.process_events().unwrap();

        assert_eq!(deleted.get(), 1);
        assert!(db.entity_with_environment_id(id).is_none());
        assert!(db.entity_type(1).unwrap().entity_by_instance_id(type_based.instance).is_none());
        assert!(db.entity_with_type_instance_id(type_based).is_none());
        assert!(matches!(db.destroy_entity(id, None), Err(WorldError::UnknownEntity(_))));
    }

    #[test]
    fn duplicate_destroy_is_a_no_op() {
        let mut db = db_with_envs();
        let id = spawn(&mut db, 1, Vec3::ZERO);
        db.destroy_entity(id, None).unwrap();
        let (event, _) = db.pending_events().iter().next().cloned().unwrap();
        db.process_events().unwrap();
        assert!(event.execute(&mut db).is_ok());
    }

    #[test]
    fn unregistered_callbacks_do_not_run() {
        let mut db = db_with_envs();
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        let id = db
            .create_entity(1, 1, Transform::IDENTITY, Some(Box::new(move |_: &Entity| seen.set(1))))
            .unwrap();
        assert!(db.unregister_entity_creation_callback(id));
        assert!(!db.unregister_entity_creation_callback(id));
        db.process_events().unwrap();
        assert_eq!(hits.get(), 0);
        assert!(!db.unregister_entity_deletion_callback(id));
    }

    #[test]
    fn change_environment_preserves_world_transform() {
        let mut db = db_with_envs();
        let mut start = Transform::from_y_rotation_degrees(30.0);
        start.position = Vec3::new(120.0, 3.0, 40.0);
        let id = db.create_entity(1, 1, start, None).unwrap();
        db.process_events().unwrap();
        let before = db.entity_with_environment_id(id).unwrap().world_transformation();

        db.change_environment(id, 2).unwrap();

        let entity = db.entity_with_environment_id(id).unwrap();
        assert_eq!(entity.environment_id(), Some(2));
        assert_eq!(entity.origin_environment_id(), 1);
        assert!(entity.world_transformation().abs_diff_eq(&before, 1e-4));
        assert!(
            entity
                .environment_transformation()
                .position
                .abs_diff_eq(Vec3::new(-380.0, 3.0, 40.0), 1e-3)
        );
        assert_eq!(db.environment(1).unwrap().originated_entity_location(id.local), Some(2));
        assert!(matches!(db.change_environment(id, 9), Err(WorldError::UnknownEnvironment(9))));
    }

    #[test]
    fn moved_entity_is_destroyed_with_origin_callback() {
        let mut db = db_with_envs();
        let id = spawn(&mut db, 1, Vec3::new(10.0, 0.0, 10.0));
        db.change_environment(id, 2).unwrap();
        let hit = Rc::new(Cell::new(false));
        let seen = hit.clone();
        let callback: EntityCallback =
            Box::new(move |e: &Entity| seen.set(e.environment_id().is_none()));
        db.destroy_entity(id, Some(callback)).unwrap();
        db.process_events().unwrap();
        assert!(hit.get());
        assert_eq!(db.environment(2).unwrap().entity_count(), 0);
        assert!(db.environment(1).unwrap().originated_entity_location(id.local).is_none());
    }

    #[test]
    fn remote_peer_mirrors_entities() {
        let mut origin = db_with_envs();
        let mut peer = db_with_envs();
        let id = origin
            .create_entity(1, 1, Transform::from_position(Vec3::new(5.0, 0.0, 5.0)), None)
            .unwrap();
        let messages = origin.process_events().unwrap();
        assert_eq!(messages.len(), 1);
        peer.receive(&messages[0]).unwrap();
        let mirrored = peer.entity_with_environment_id(id).unwrap();
        assert_eq!(
            mirrored.type_based_id(),
            origin.entity_with_environment_id(id).unwrap().type_based_id()
        );
        assert!(peer.receive(&messages[0]).is_err());

        origin.destroy_entity(id, None).unwrap();
        for message in origin.process_events().unwrap() {
            peer.receive(&message).unwrap();
        }
        assert!(peer.entity_with_environment_id(id).is_none());
        assert_eq!(peer.entity_type(1).unwrap().instance_count(), 0);
    }

    fn deliver(from: &mut WorldDatabase, to: &mut WorldDatabase) {
        for message in from.process_events().unwrap() {
            to.receive(&message).unwrap();
        }
    }

    #[test]
    fn mirrored_ids_are_not_reissued() {
        let mut origin = db_with_envs();
        let mut peer = db_with_envs();
        let a = origin.create_entity(1, 1, Transform::IDENTITY, None).unwrap();
        deliver(&mut origin, &mut peer);

        let b = peer.create_entity(1, 1, Transform::IDENTITY, None).unwrap();
        assert_ne!(a, b);
        deliver(&mut peer, &mut origin);

        for db in [&origin, &peer] {
            let first = db.entity_with_environment_id(a).unwrap().type_based_id();
            let second = db.entity_with_environment_id(b).unwrap().type_based_id();
            assert_ne!(first, second);
            assert_eq!(db.environment(1).unwrap().entity_count(), 2);
        }
    }

    #[test]
    fn concurrent_peers_issue_distinct_ids() {
        let mut first = db_with_envs();
        let mut second = db_with_envs().with_peer_slot(1);
        let mut ids = Vec::new();
        for db in [&mut first, &mut second] {
            for i in 0..3 {
                let position = Vec3::new(i as f32, 0.0, 1.0);
                ids.push(db.create_entity(1, 1, Transform::from_position(position), None).unwrap());
            }
            ids.push(db.create_entity(1, 2, Transform::IDENTITY, None).unwrap());
        }
        deliver(&mut first, &mut second);
        deliver(&mut second, &mut first);

        let distinct: std::collections::BTreeSet<_> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 8);
        for &id in &ids {
            let here = first.entity_with_environment_id(id).unwrap().type_based_id();
            let there = second.entity_with_environment_id(id).unwrap().type_based_id();
            assert_eq!(here, there);
        }
        for db in [&first, &second] {
            assert_eq!(db.environment(1).unwrap().entity_count(), 6);
            assert_eq!(db.environment(2).unwrap().entity_count(), 2);
            assert_eq!(db.entity_type(1).unwrap().instance_count(), 8);
        }
    }

    #[test]
    fn failed_creation_drops_callback() {
        let mut db = db_with_envs();
        let hit = Rc::new(Cell::new(false));
        let seen = hit.clone();
        let callback: EntityCallback = Box::new(move |_: &Entity| seen.set(true));
        let id = db
            .create_entity(1, 1, Transform::IDENTITY, Some(callback))
            .unwrap();
        assert!(db.environment(1).unwrap().has_pending_creation(id));
        db.delete_entity_type(1).unwrap();
        db.process_events().unwrap();

        assert!(!hit.get());
        let env = db.environment(1).unwrap();
        assert!(!env.has_pending_creation(id));
        assert!(!env.id_pools().local().unwrap().is_allocated(u32::from(id.local)));
    }

    #[test]
    fn reused_instance_id_is_refused() {
        let mut db = db_with_envs();
        let a = spawn(&mut db, 1, Vec3::ZERO);
        let type_based_id = db.entity_with_environment_id(a).unwrap().type_based_id();
        let event = CreateEntityEvent {
            type_based_id,
            environment_based_id: EnvironmentBasedId::new(2, 4500),
            transform: Transform::IDENTITY,
        };
        db.send_event(event.into(), ExecutionScope::Local);
        db.process_events().unwrap();

        assert_eq!(db.environment(2).unwrap().entity_count(), 0);
        assert_eq!(db.entity_type(1).unwrap().instance_count(), 1);
        let found = db.entity_with_type_instance_id(type_based_id).unwrap();
        assert_eq!(found.environment_based_id(), a);
        let pools = db.entity_type(1).unwrap().id_pools();
        assert!(pools.local().unwrap().is_allocated(u32::from(type_based_id.instance)));
    }

    #[test]
    fn delete_entity_type_destroys_instances() {
        let mut db = db_with_envs();
        let a = spawn(&mut db, 1, Vec3::ZERO);
        let b = spawn(&mut db, 2, Vec3::ZERO);
        assert!(db.id_pool("ball_globalEntityIdPool_1").is_some());
        let removed = db.delete_entity_type(1).unwrap();
        assert_eq!(removed.instance_count(), 0);
        assert!(db.entity_with_environment_id(a).is_none());
        assert!(db.entity_with_environment_id(b).is_none());
        assert!(db.id_pool("ball_globalEntityIdPool_1").is_none());
        assert!(matches!(db.delete_entity_type(1), Err(WorldError::UnknownEntityType(1))));
    }

    #[test]
    fn pool_registry_resolves_both_namespaces() {
        let db = db_with_envs();
        assert_eq!(db.id_pool("Env2_pool").unwrap().range(), 0..65536);
        assert!(db.id_pool("Env9_pool").is_none());
        assert_eq!(db.id_pool_names().count(), 3);
    }

    #[test]
    fn lookups_miss_cleanly() {
        let db = db_with_envs();
        assert!(db.entity_type(7).is_none());
        assert!(db.entity_type_by_name("ball").is_some());
        assert!(db.tile(3).is_none());
        assert!(db.environment(42).is_none());
        assert_eq!(db.environment_at_world_position(Vec3::new(650.0, 0.0, 10.0)).unwrap().id(), 2);
        assert!(db.environment_at_world_position(Vec3::new(-1.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn spacing_locks_once_environments_exist() {
        let mut db = WorldDatabase::new();
        assert!(matches!(db.set_spacing(0, 10), Err(WorldError::InvalidSpacing { .. })));
        db.set_spacing(50, 50).unwrap();
        db.create_environment(1, 0, 0, 1, 1).unwrap();
        db.process_events().unwrap();
        assert!(matches!(db.set_spacing(100, 100), Err(WorldError::SpacingLocked)));
        assert!(db.set_spacing(50, 50).is_ok());
    }

    #[test]
    fn headless_and_scene_graph_notifications() {
        let (log, sg) = CallLog::shared();
        let mut db = db_with_envs();
        let id = spawn(&mut db, 1, Vec3::ZERO);
        db.set_scene_graph(Some(sg));
        assert!(log.borrow().calls.contains(&Call::AttachEnvironment(1)));
        assert!(log.borrow().calls.contains(&Call::AttachEntity(id)));

        db.destroy_entity(id, None).unwrap();
        db.process_events().unwrap();
        assert_eq!(log.borrow().calls.last(), Some(&Call::DetachEntity(id)));

        db.clear_world();
        assert!(log.borrow().calls.contains(&Call::DetachEnvironment(2)));
        assert_eq!(db.environments().count(), 0);
        assert_eq!(db.id_pool_names().count(), 0);
    }

    #[test]
    fn entity_type_model_change_reaches_instances() {
        use crate::model::{CloneMode, FileModel};
        let mut db = db_with_envs();
        let id = spawn(&mut db, 1, Vec3::ZERO);
        assert!(db.entity_with_environment_id(id).unwrap().model().is_none());
        db.set_entity_type_model(1, Some(Box::new(FileModel::new("ball.wrl", CloneMode::Shallow))))
            .unwrap();
        let entity = db.entity_with_environment_id(id).unwrap();
        assert_eq!(entity.model().unwrap().source(), "ball.wrl");
    }

    #[test]
    fn avatars_attach_and_detach_models() {
        let (log, sg) = CallLog::shared();
        let mut db = WorldDatabase::new().with_scene_graph(sg);
        let config: AvatarConfig =
            serde_yaml::from_str("name: guest\nrepresentation:\n  file: guest.wrl\n").unwrap();
        let handle = db.load_avatar(&config).unwrap();
        assert_eq!(db.avatar(handle).unwrap().name(), "guest");
        assert!(db.show_avatar(handle, false));
        db.update_avatars(0.1);
        let avatar = db.remove_avatar(handle).unwrap();
        assert!(!avatar.is_visible());
        assert_eq!(
            log.borrow().calls,
            vec![
                Call::AttachModel("guest.wrl".into()),
                Call::ShowModel("guest.wrl".into(), false),
                Call::DetachModel("guest.wrl".into()),
            ]
        );

        let mut other = config.clone();
        other.implementation_class = "Robot".into();
        assert!(matches!(db.load_avatar(&other), Err(WorldError::NoAvatarFactory(_))));
    }

    #[test]
    fn dump_lists_everything() {
        let mut db = db_with_envs();
        spawn(&mut db, 1, Vec3::ZERO);
        let text = db.dump();
        assert!(text.contains("2 environments"));
        assert!(text.contains("EntityType 1 'ball'"));
        assert!(text.contains("Environment 2"));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dump_is_logged_once() {
        let mut db = db_with_envs();
        spawn(&mut db, 1, Vec3::ZERO);
        db.add_tile(Tile::new(3, "floor", 100, 100)).unwrap();
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let text = tracing::subscriber::with_default(subscriber, || db.dump());

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logged.matches("EntityType 1 'ball'").count(), 1);
        assert_eq!(logged.matches("Environment 1").count(), 1);
        assert_eq!(logged.matches("floor").count(), 1);
        assert_eq!(text.matches("EntityType 1 'ball'").count(), 1);
    }
}
