use glam::{Quat, Vec3};
use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::fmt::Write as _;
use worldbase_common::{EnvironmentBasedId, EnvironmentId, IdError, Transform};

use crate::entity::{EntityCallback, EnvLink, Entity};
use crate::entity_type::EntityType;
use crate::error::WorldError;
use crate::events::{CreateEntityEvent, DestroyEntityEvent};
use crate::grid::{CellCoord, GridSpacing, PlacementConflict, TileGrid};
use crate::pools::EntityIdPools;
use crate::scene::{SharedSceneGraph, notify};
use crate::tile::Tile;

/// Axis an entry point's orientation turns onto its direction.
const FORWARD: Vec3 = Vec3::NEG_Z;

/// Rotation that turns `FORWARD` onto `direction` while keeping the up
/// vector on the upper half.
fn entry_orientation(direction: Vec3) -> Quat {
    let dir = direction.normalize_or_zero();
    if dir == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    let mut rotation = Quat::from_rotation_arc(FORWARD, dir);
    if (rotation * Vec3::Y).y < 0.0 {
        rotation = (rotation * Quat::from_axis_angle(FORWARD, PI)).normalize();
    }
    rotation
}

/// Environment-local placement of a tile anchored at `anchor`.
fn tile_placement(tile: &Tile, anchor: CellCoord, spacing: GridSpacing) -> Transform {
    let x = anchor.x as f32 * spacing.x as f32 + tile.x_size() as f32 / 2.0;
    let z = anchor.z as f32 * spacing.z as f32 + tile.z_size() as f32 / 2.0;
    Transform {
        position: Vec3::new(x, tile.height(), z),
        ..Transform::from_y_rotation_degrees(tile.y_rotation().degrees() as f32)
    }
}

/// A spatial region: a resizable tile grid plus the entities resident in it.
///
/// The world position is `(pos_x * spacing.x, 0, pos_z * spacing.z)`. The
/// environment owns its resident entities and every placed tile clone. It
/// also keeps the ids and pending callbacks of entities that originated here,
/// wherever they currently reside.
pub struct Environment {
    id: EnvironmentId,
    pos_x: i32,
    pos_z: i32,
    spacing: GridSpacing,
    grid: TileGrid,
    entry_points: Vec<Transform>,
    entities: BTreeMap<EnvironmentBasedId, Entity>,
    originated: BTreeMap<u16, EnvironmentId>,
    pools: EntityIdPools,
    creation_callbacks: BTreeMap<EnvironmentBasedId, EntityCallback>,
    deletion_callbacks: BTreeMap<EnvironmentBasedId, EntityCallback>,
    visible: bool,
    scene: Option<SharedSceneGraph>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("position", &(self.pos_x, self.pos_z))
            .field("size", &(self.grid.size_x(), self.grid.size_z()))
            .field("tiles", &self.grid.tile_count())
            .field("entities", &self.entities.len())
            .field("entry_points", &self.entry_points.len())
            .finish()
    }
}

impl Environment {
    pub fn new(
        id: EnvironmentId,
        pos_x: i32,
        pos_z: i32,
        size_x: u32,
        size_z: u32,
        spacing: GridSpacing,
    ) -> Self {
        Self {
            id,
            pos_x,
            pos_z,
            spacing,
            grid: TileGrid::new(size_x, size_z),
            entry_points: Vec::new(),
            entities: BTreeMap::new(),
            originated: BTreeMap::new(),
            pools: EntityIdPools::new(),
            creation_callbacks: BTreeMap::new(),
            deletion_callbacks: BTreeMap::new(),
            visible: true,
            scene: None,
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    /// Grid X coordinate of the environment origin.
    pub fn x_position(&self) -> i32 {
        self.pos_x
    }

    pub fn z_position(&self) -> i32 {
        self.pos_z
    }

    pub fn set_x_position(&mut self, pos_x: i32) {
        self.pos_x = pos_x;
        self.moved();
    }

    pub fn set_z_position(&mut self, pos_z: i32) {
        self.pos_z = pos_z;
        self.moved();
    }

    fn moved(&mut self) {
        self.refresh_links();
        notify(&self.scene, |sg| sg.update_environment(self));
        for entity in self.entities.values() {
            entity.update();
        }
    }

    fn refresh_links(&mut self) {
        let world = self.world_transformation();
        for entity in self.entities.values_mut() {
            entity.set_link_world(world);
        }
    }

    pub fn size_x(&self) -> u32 {
        self.grid.size_x()
    }

    pub fn size_z(&self) -> u32 {
        self.grid.size_z()
    }

    pub fn spacing(&self) -> GridSpacing {
        self.spacing
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Translation of the environment origin in world space.
    pub fn world_transformation(&self) -> Transform {
        Transform::from_position(Vec3::new(
            (self.pos_x as i64 * self.spacing.x as i64) as f32,
            0.0,
            (self.pos_z as i64 * self.spacing.z as i64) as f32,
        ))
    }

    /// World-space rectangle `(min_x, min_z, max_x, max_z)`, max exclusive.
    pub fn world_bounds(&self) -> (i64, i64, i64, i64) {
        let min_x = self.pos_x as i64 * self.spacing.x as i64;
        let min_z = self.pos_z as i64 * self.spacing.z as i64;
        (
            min_x,
            min_z,
            min_x + self.grid.size_x() as i64 * self.spacing.x as i64,
            min_z + self.grid.size_z() as i64 * self.spacing.z as i64,
        )
    }

    pub fn contains_world_position(&self, position: Vec3) -> bool {
        self.world_to_cell(position).is_some()
    }

    fn world_to_cell(&self, position: Vec3) -> Option<CellCoord> {
        let (min_x, min_z, _, _) = self.world_bounds();
        let cx = ((position.x as f64 - min_x as f64) / self.spacing.x as f64).floor();
        let cz = ((position.z as f64 - min_z as f64) / self.spacing.z as f64).floor();
        let range = i32::MIN as f64..=i32::MAX as f64;
        if !range.contains(&cx) || !range.contains(&cz) {
            return None;
        }
        let cell = CellCoord::new(cx as i32, cz as i32);
        self.grid.in_bounds(cell).then_some(cell)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        notify(&self.scene, |sg| sg.show_environment(self, visible));
    }

    pub fn scene_graph(&self) -> Option<&SharedSceneGraph> {
        self.scene.as_ref()
    }

    /// Swap the scene graph: everything is detached from the old one and
    /// attached to the new one.
    pub fn set_scene_graph(&mut self, scene: Option<SharedSceneGraph>) {
        self.detach_from_scene();
        self.scene = scene;
        for entity in self.entities.values_mut() {
            entity.set_scene(self.scene.clone());
        }
        let Some(sg) = &self.scene else {
            return;
        };
        let mut sg = sg.borrow_mut();
        sg.attach_environment(self);
        for (tile, _) in self.grid.tiles() {
            if let Some(placement) = tile.placement() {
                sg.attach_tile(self, tile, placement);
            }
        }
        for entity in self.entities.values() {
            sg.attach_entity(entity);
        }
        if !self.visible {
            sg.show_environment(self, false);
        }
    }

    pub(crate) fn detach_from_scene(&mut self) {
        if let Some(sg) = &self.scene {
            let mut sg = sg.borrow_mut();
            for entity in self.entities.values() {
                sg.detach_entity(entity);
            }
            for (tile, _) in self.grid.tiles() {
                sg.detach_tile(self, tile);
            }
            sg.detach_environment(self);
        }
        for entity in self.entities.values_mut() {
            entity.set_scene(None);
        }
    }

    /// Place `tile` with its footprint anchored at `(x, z)`. A refused tile
    /// is dropped.
    pub fn set_tile_at_grid_position(
        &mut self,
        x: i32,
        z: i32,
        mut tile: Tile,
    ) -> Result<(), WorldError> {
        let spacing = self.spacing;
        if tile.x_size() == 0
            || tile.z_size() == 0
            || tile.x_size() % spacing.x != 0
            || tile.z_size() % spacing.z != 0
        {
            return Err(WorldError::MisalignedTile {
                tile: tile.id(),
                x_size: tile.x_size(),
                z_size: tile.z_size(),
                x_spacing: spacing.x,
                z_spacing: spacing.z,
            });
        }
        let span = (tile.x_size() / spacing.x, tile.z_size() / spacing.z);
        let anchor = CellCoord::new(x, z);
        let tile_id = tile.id();
        let placement = tile_placement(&tile, anchor, spacing);
        tile.set_placement(Some(placement));
        if let Err((_, conflict)) = self.grid.place(anchor, span, tile) {
            return Err(match conflict {
                PlacementConflict::OutOfBounds => WorldError::TileOutOfBounds {
                    tile: tile_id,
                    x,
                    z,
                    size_x: self.grid.size_x(),
                    size_z: self.grid.size_z(),
                },
                PlacementConflict::Occupied(at) => WorldError::TileOverlap {
                    tile: tile_id,
                    x,
                    z,
                    at_x: at.x,
                    at_z: at.z,
                },
            });
        }
        tracing::debug!(env = self.id, tile = tile_id, x, z, ?span, "tile placed");
        if let Some(placed) = self.grid.get(anchor) {
            notify(&self.scene, |sg| sg.attach_tile(self, placed, &placement));
        }
        Ok(())
    }

    /// Take the tile covering `(x, z)` out of the grid. The caller owns it.
    ///
    /// # Panics
    /// If the grid cells of the tile's footprint are inconsistent.
    pub fn remove_tile_at_grid_position(&mut self, x: i32, z: i32) -> Option<Tile> {
        let cell = CellCoord::new(x, z);
        if !self.grid.in_bounds(cell) {
            tracing::warn!(env = self.id, x, z, "tile removal outside grid");
            return None;
        }
        let tile = self.grid.get(cell)?;
        notify(&self.scene, |sg| sg.detach_tile(self, tile));
        let (mut tile, _) = self.grid.remove(cell)?;
        tile.set_placement(None);
        Some(tile)
    }

    pub fn tile_at_grid_position(&self, x: i32, z: i32) -> Option<&Tile> {
        self.grid.get(CellCoord::new(x, z))
    }

    pub fn tile_at_world_position(&self, position: Vec3) -> Option<&Tile> {
        self.world_to_cell(position).and_then(|c| self.grid.get(c))
    }

    /// World-space centre of cell `(x, z)`.
    pub fn world_position_of_tile(&self, x: i32, z: i32) -> Vec3 {
        let (min_x, min_z, _, _) = self.world_bounds();
        Vec3::new(
            min_x as f32 + (x as f32 + 0.5) * self.spacing.x as f32,
            0.0,
            min_z as f32 + (z as f32 + 0.5) * self.spacing.z as f32,
        )
    }

    /// Remove every tile, detaching them from the scene graph.
    pub fn clear_tiles(&mut self) -> Vec<Tile> {
        if let Some(sg) = &self.scene {
            let mut sg = sg.borrow_mut();
            for (tile, _) in self.grid.tiles() {
                sg.detach_tile(self, tile);
            }
        }
        self.grid
            .drain()
            .into_iter()
            .map(|(mut tile, _)| {
                tile.set_placement(None);
                tile
            })
            .collect()
    }

    /// Grow the grid by `|dx| x |dz|` cells. Negative values grow towards
    /// negative X/Z; existing content keeps its world position.
    pub fn enlarge_environment(&mut self, dx: i32, dz: i32) {
        let mov = self.grid.enlarge(dx, dz);
        let spacing = self.spacing;
        if mov != CellCoord::new(0, 0) {
            self.pos_x -= mov.x;
            self.pos_z -= mov.z;
            let shift_x = (mov.x as i64 * spacing.x as i64) as f32;
            let shift_z = (mov.z as i64 * spacing.z as i64) as f32;
            for entity in self.entities.values_mut() {
                entity.offset_local_position(shift_x, shift_z);
            }
            for entry in &mut self.entry_points {
                entry.position.x += shift_x;
                entry.position.z += shift_z;
            }
            for (tile, anchor) in self.grid.tiles_mut() {
                let placement = tile_placement(tile, anchor, spacing);
                tile.set_placement(Some(placement));
            }
            self.refresh_links();
        }
        tracing::debug!(
            env = self.id,
            dx,
            dz,
            size_x = self.grid.size_x(),
            size_z = self.grid.size_z(),
            "environment enlarged"
        );
        if let Some(sg) = &self.scene {
            let mut sg = sg.borrow_mut();
            sg.update_environment(self);
            for (tile, _) in self.grid.tiles() {
                sg.update_tile(self, tile);
            }
            for entity in self.entities.values() {
                sg.update_entity(entity);
            }
        }
    }

    /// Add a start location facing `direction`; returns its index.
    pub fn add_entry_point(&mut self, position: Vec3, direction: Vec3) -> usize {
        self.entry_points.push(Transform {
            position,
            rotation: entry_orientation(direction),
            ..Transform::IDENTITY
        });
        self.entry_points.len() - 1
    }

    pub fn delete_entry_point(&mut self, index: usize) -> bool {
        if index < self.entry_points.len() {
            self.entry_points.remove(index);
            true
        } else {
            tracing::warn!(env = self.id, index, "no such entry point");
            false
        }
    }

    pub fn clear_entry_points(&mut self) {
        self.entry_points.clear();
    }

    pub fn entry_points(&self) -> &[Transform] {
        &self.entry_points
    }

    pub fn entry_point_count(&self) -> usize {
        self.entry_points.len()
    }

    /// Environment-local transform of entry point `index`.
    pub fn start_transformation(&self, index: usize) -> Option<Transform> {
        let start = self.entry_points.get(index).copied();
        if start.is_none() {
            tracing::warn!(env = self.id, index, "no such entry point");
        }
        start
    }

    pub fn world_start_transformation(&self, index: usize) -> Option<Transform> {
        self.start_transformation(index)
            .map(|t| self.convert_environment_to_world(&t))
    }

    pub fn convert_world_to_environment(&self, transform: &Transform) -> Transform {
        self.world_transformation().inverse() * *transform
    }

    pub fn convert_environment_to_world(&self, transform: &Transform) -> Transform {
        self.world_transformation() * *transform
    }

    pub fn id_pools(&self) -> &EntityIdPools {
        &self.pools
    }

    /// Registry name of the environment's global entity id pool.
    pub fn global_entity_id_pool_name(&self) -> String {
        format!("Env{}_pool", self.id)
    }

    pub fn set_local_entity_id_pool(&mut self, min: u32, max: u32) -> Result<(), IdError> {
        self.pools.set_local(min, max)
    }

    pub(crate) fn reserve_load_time_entity_id(&mut self, local: u16) -> Result<(), IdError> {
        self.pools.reserve_load_time(local)
    }

    pub(crate) fn set_peer_slot(&mut self, slot: u16) {
        self.pools.set_peer_slot(slot);
    }

    /// Keep a local id issued by another peer out of this peer's allocations.
    pub(crate) fn record_remote_entity_id(&mut self, local: u16) {
        self.pools.record_remote(local);
    }

    /// Give up a creation that never executed: drop its pending callback
    /// and, when `release_id` holds, recycle the reserved local id.
    pub(crate) fn abandon_creation(&mut self, id: EnvironmentBasedId, release_id: bool) {
        if self.creation_callbacks.remove(&id).is_some() {
            tracing::debug!(env = self.id, %id, "dropped creation callback of failed creation");
        }
        if release_id {
            self.pools.release(id.local);
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Resident entity with the given id.
    pub fn entity_by_environment_based_id(&self, id: EnvironmentBasedId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_by_environment_based_id_mut(
        &mut self,
        id: EnvironmentBasedId,
    ) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains_entity(&self, id: EnvironmentBasedId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Where an entity that originated here currently resides.
    pub fn originated_entity_location(&self, local: u16) -> Option<EnvironmentId> {
        self.originated.get(&local).copied()
    }

    /// Local ids of live entities that originated here.
    pub fn originated_entities(&self) -> impl Iterator<Item = (u16, EnvironmentId)> + '_ {
        self.originated.iter().map(|(&l, &e)| (l, e))
    }

    pub(crate) fn record_originated(&mut self, local: u16, resides_in: EnvironmentId) {
        self.originated.insert(local, resides_in);
    }

    /// Make an existing entity resident here. Hands it back if an entity
    /// with the same id is already resident.
    pub(crate) fn add_entity(&mut self, mut entity: Entity) -> Result<(), Entity> {
        let id = entity.environment_based_id();
        if self.entities.contains_key(&id) {
            tracing::error!(env = self.id, %id, "entity already resident");
            return Err(entity);
        }
        entity.link(
            EnvLink {
                id: self.id,
                world: self.world_transformation(),
            },
            self.scene.clone(),
        );
        self.entities.insert(id, entity);
        if let Some(entity) = self.entities.get(&id) {
            notify(&self.scene, |sg| sg.attach_entity(entity));
        }
        Ok(())
    }

    /// Make a newly created entity resident here, recording it as
    /// originated here and consuming its pending creation callback.
    pub(crate) fn add_new_entity(&mut self, entity: Entity) -> Result<(), Entity> {
        let id = entity.environment_based_id();
        self.add_entity(entity)?;
        if id.origin == self.id {
            self.originated.insert(id.local, self.id);
        }
        if let Some(callback) = self.creation_callbacks.remove(&id) {
            if let Some(entity) = self.entities.get(&id) {
                tracing::debug!(env = self.id, %id, "invoking creation callback");
                callback(entity);
            }
        }
        Ok(())
    }

    /// Detach a resident entity that is moving elsewhere or being disposed.
    pub(crate) fn remove_entity(&mut self, id: EnvironmentBasedId) -> Option<Entity> {
        let Some(entity) = self.entities.get(&id) else {
            tracing::error!(env = self.id, %id, "entity not resident");
            return None;
        };
        notify(&self.scene, |sg| sg.detach_entity(entity));
        let mut entity = self.entities.remove(&id)?;
        entity.unlink();
        Some(entity)
    }

    /// Purge a destroyed entity that originated here from the origin index
    /// and recycle its local id. With `fire_callback` the pending deletion
    /// callback is consumed and invoked; otherwise it stays pending.
    pub(crate) fn remove_deleted_entity(&mut self, entity: &Entity, fire_callback: bool) {
        let id = entity.environment_based_id();
        self.originated.remove(&id.local);
        self.pools.release(id.local);
        if !fire_callback {
            return;
        }
        if let Some(callback) = self.deletion_callbacks.remove(&id) {
            tracing::debug!(env = self.id, %id, "invoking deletion callback");
            callback(entity);
        }
    }

    /// Reserve a fresh local id and describe the entity to create. The
    /// entity does not exist until the returned event executes.
    pub fn create_entity(
        &mut self,
        entity_type: &mut EntityType,
        transform: Transform,
        callback: Option<EntityCallback>,
    ) -> Result<CreateEntityEvent, WorldError> {
        let local = self.pools.alloc_runtime()?;
        let id = EnvironmentBasedId::new(self.id, local);
        let event = match entity_type.create_entity_creation_event(id, transform) {
            Ok(event) => event,
            Err(err) => {
                self.pools.release(local);
                return Err(err.into());
            }
        };
        if let Some(callback) = callback {
            self.creation_callbacks.insert(id, callback);
        }
        tracing::debug!(
            env = self.id,
            %id,
            type_based_id = %event.type_based_id,
            "entity creation requested"
        );
        Ok(event)
    }

    /// Describe the destruction of an entity that originated here.
    pub fn destroy_entity(
        &mut self,
        id: EnvironmentBasedId,
        callback: Option<EntityCallback>,
    ) -> Result<DestroyEntityEvent, WorldError> {
        if id.origin != self.id {
            tracing::error!(env = self.id, %id, "destroy routed to wrong environment");
            return Err(WorldError::ForeignOrigin { id, env: self.id });
        }
        if let Some(callback) = callback {
            self.deletion_callbacks.insert(id, callback);
        }
        Ok(DestroyEntityEvent {
            environment_based_id: id,
        })
    }

    /// Withdraw a pending creation callback; false if none is pending.
    pub fn unregister_entity_creation_callback(&mut self, id: EnvironmentBasedId) -> bool {
        self.creation_callbacks.remove(&id).is_some()
    }

    pub fn unregister_entity_deletion_callback(&mut self, id: EnvironmentBasedId) -> bool {
        self.deletion_callbacks.remove(&id).is_some()
    }

    pub fn has_pending_creation(&self, id: EnvironmentBasedId) -> bool {
        self.creation_callbacks.contains_key(&id)
    }

    pub fn has_pending_deletion(&self, id: EnvironmentBasedId) -> bool {
        self.deletion_callbacks.contains_key(&id)
    }

    /// Nearest movable entity hit by the world-space ray, with its distance.
    /// Needs a scene graph for the geometric test.
    pub fn ray_intersect(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<(EnvironmentBasedId, f32)> {
        let sg = self.scene.as_ref()?.borrow();
        let nearest = self
            .entities
            .values()
            .filter(|e| !e.is_fixed())
            .filter_map(|e| {
                let model = e.model()?;
                let at = e.world_transformation();
                let hit = sg.ray_intersect(model, &at, origin, direction, max_distance)?;
                (hit > 0.0).then_some((e.environment_based_id(), hit))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        nearest
    }

    /// Drop every resident entity and pending callback. Used on shutdown,
    /// after entity types have forgotten their instances.
    pub(crate) fn take_entities(&mut self) -> Vec<Entity> {
        self.creation_callbacks.clear();
        self.deletion_callbacks.clear();
        self.originated.clear();
        std::mem::take(&mut self.entities)
            .into_values()
            .map(|mut e| {
                e.unlink();
                e
            })
            .collect()
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let (min_x, min_z, max_x, max_z) = self.world_bounds();
        let _ = writeln!(
            out,
            "Environment {} at grid ({}, {}), size {}x{}, world [{}, {}]..[{}, {}]",
            self.id,
            self.pos_x,
            self.pos_z,
            self.grid.size_x(),
            self.grid.size_z(),
            min_x,
            min_z,
            max_x,
            max_z
        );
        for (tile, anchor) in self.grid.tiles() {
            let _ = writeln!(
                out,
                "  tile {} '{}' at ({}, {})",
                tile.id(),
                tile.name(),
                anchor.x,
                anchor.z
            );
        }
        for entity in self.entities.values() {
            let p = entity.environment_transformation().position;
            let _ = writeln!(
                out,
                "  entity {} ({}) at ({:.2}, {:.2}, {:.2})",
                entity.environment_based_id(),
                entity.type_based_id(),
                p.x,
                p.y,
                p.z
            );
        }
        for (i, entry) in self.entry_points.iter().enumerate() {
            let p = entry.position;
            let _ = writeln!(out, "  entry {i} at ({:.2}, {:.2}, {:.2})", p.x, p.y, p.z);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::CountingModel;
    use crate::scene::testing::{Call, CallLog};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn env() -> Environment {
        Environment::new(1, 0, 0, 4, 4, GridSpacing::default())
    }

    fn tile(id: u32, x: u32, z: u32) -> Tile {
        Tile::new(id, format!("t{id}"), x, z)
    }

    fn resident(
        env: &mut Environment,
        ty: &mut EntityType,
        local: u16,
        position: Vec3,
    ) -> EnvironmentBasedId {
        let id = EnvironmentBasedId::new(env.id(), local);
        let mut entity = ty.create_instance_unchecked(local, id).unwrap();
        entity.store_transformation(Transform::from_position(position));
        env.add_new_entity(entity).unwrap();
        id
    }

    #[test]
    fn placement_covers_footprint() {
        let mut env = env();
        env.set_tile_at_grid_position(1, 0, tile(2, 200, 300)).unwrap();
        for x in 1..3 {
            for z in 0..3 {
                assert_eq!(env.tile_at_grid_position(x, z).unwrap().id(), 2);
            }
        }
        assert!(env.tile_at_grid_position(0, 0).is_none());
        assert!(env.tile_at_grid_position(3, 0).is_none());
        let placement = env.tile_at_grid_position(2, 2).unwrap().placement().unwrap();
        assert_eq!(placement.position, Vec3::new(200.0, 0.0, 150.0));
    }

    #[test]
    fn rejected_tile_is_freed_and_grid_unchanged() {
        let live = Rc::new(Cell::new(0));
        let mut env = env();
        let first = tile(1, 200, 200).with_model(Some(Box::new(CountingModel::new(&live))));
        env.set_tile_at_grid_position(0, 0, first).unwrap();
        assert_eq!(live.get(), 1);

        let second = tile(2, 200, 200).with_model(Some(Box::new(CountingModel::new(&live))));
        assert_eq!(live.get(), 2);
        let err = env.set_tile_at_grid_position(1, 1, second).unwrap_err();
        assert!(matches!(err, WorldError::TileOverlap { at_x: 0, at_z: 0, .. }));
        assert_eq!(live.get(), 1);
        assert_eq!(env.grid().occupied_cells(), 4);
        assert!(env.tile_at_grid_position(2, 2).is_none());

        let third = tile(3, 100, 100).with_model(Some(Box::new(CountingModel::new(&live))));
        assert!(matches!(
            env.set_tile_at_grid_position(4, 0, third),
            Err(WorldError::TileOutOfBounds { .. })
        ));
        assert_eq!(live.get(), 1);
    }

    #[test]
    fn misaligned_tile_refused() {
        let mut env = env();
        assert!(matches!(
            env.set_tile_at_grid_position(0, 0, tile(1, 150, 100)),
            Err(WorldError::MisalignedTile { .. })
        ));
        assert_eq!(env.grid().occupied_cells(), 0);
    }

    #[test]
    fn rotated_tile_placement() {
        let mut env = env();
        let t = tile(5, 100, 100).with_height(2.0).with_rotation(crate::tile::TileRotation::Deg90);
        env.set_tile_at_grid_position(3, 3, t).unwrap();
        let placement = *env.tile_at_grid_position(3, 3).unwrap().placement().unwrap();
        assert_eq!(placement.position, Vec3::new(350.0, 2.0, 350.0));
        let forward = placement.rotation * Vec3::NEG_Z;
        assert!(forward.abs_diff_eq(Vec3::NEG_X, 1e-5));
    }

    #[test]
    fn remove_tile_notifies_and_clears() {
        let (log, sg) = CallLog::shared();
        let mut env = env();
        env.set_scene_graph(Some(sg));
        env.set_tile_at_grid_position(0, 0, tile(7, 200, 100)).unwrap();
        let removed = env.remove_tile_at_grid_position(1, 0).unwrap();
        assert_eq!(removed.id(), 7);
        assert!(removed.placement().is_none());
        assert_eq!(env.grid().occupied_cells(), 0);
        assert!(env.remove_tile_at_grid_position(0, 0).is_none());
        assert!(env.remove_tile_at_grid_position(-1, 9).is_none());
        let log = log.borrow();
        let calls = &log.calls;
        assert!(calls.contains(&Call::DetachTile(1, 7)));
        assert!(matches!(calls[1], Call::AttachTile(1, 7, _)));
    }

    #[test]
    fn negative_growth_preserves_world_position() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        env.set_tile_at_grid_position(0, 0, tile(9, 100, 100)).unwrap();
        let id = resident(&mut env, &mut ty, 0, Vec3::new(50.0, 0.0, 50.0));
        env.add_entry_point(Vec3::new(10.0, 0.0, 10.0), Vec3::NEG_Z);
        let before = env.entity_by_environment_based_id(id).unwrap().world_transformation();
        let entry_before = env.world_start_transformation(0).unwrap();

        env.enlarge_environment(-1, 0);

        assert_eq!((env.size_x(), env.size_z()), (5, 4));
        assert_eq!(env.x_position(), -1);
        let after = env.entity_by_environment_based_id(id).unwrap().world_transformation();
        assert!(after.abs_diff_eq(&before, 1e-4));
        assert!(env.world_start_transformation(0).unwrap().abs_diff_eq(&entry_before, 1e-4));
        assert!(env.tile_at_grid_position(0, 0).is_none());
        assert_eq!(env.tile_at_grid_position(1, 0).unwrap().id(), 9);
        assert_eq!(
            env.tile_at_world_position(Vec3::new(50.0, 0.0, 50.0)).unwrap().id(),
            9
        );
    }

    #[test]
    fn positive_growth_keeps_origin() {
        let mut env = env();
        env.enlarge_environment(2, 1);
        assert_eq!((env.size_x(), env.size_z()), (6, 5));
        assert_eq!((env.x_position(), env.z_position()), (0, 0));
    }

    #[test]
    fn entry_point_faces_direction() {
        let mut env = env();
        for dir in [Vec3::X, Vec3::NEG_X, Vec3::Z, Vec3::NEG_Z, Vec3::new(1.0, 0.0, 1.0)] {
            let i = env.add_entry_point(Vec3::ZERO, dir);
            let rot = env.start_transformation(i).unwrap().rotation;
            assert!((rot * FORWARD).abs_diff_eq(dir.normalize(), 1e-5), "{dir:?}");
            assert!((rot * Vec3::Y).y > 0.0, "{dir:?}");
        }
        assert!(env.delete_entry_point(0));
        assert!(!env.delete_entry_point(10));
        assert_eq!(env.entry_point_count(), 4);
        assert!(env.start_transformation(4).is_none());
    }

    #[test]
    fn world_start_transform_includes_origin() {
        let mut env = Environment::new(2, 3, 1, 2, 2, GridSpacing::default());
        env.add_entry_point(Vec3::new(10.0, 1.0, 20.0), Vec3::NEG_Z);
        let world = env.world_start_transformation(0).unwrap();
        assert!(world.position.abs_diff_eq(Vec3::new(310.0, 1.0, 120.0), 1e-4));
    }

    #[test]
    fn creation_callback_fires_once_on_add() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        let callback: EntityCallback = Box::new(move |_: &Entity| seen.set(seen.get() + 1));
        let event = env
            .create_entity(&mut ty, Transform::IDENTITY, Some(callback))
            .unwrap();
        let id = event.environment_based_id;
        assert!(u32::from(id.local) >= 4096);
        assert!(env.has_pending_creation(id));

        let entity = ty.create_instance_unchecked(event.type_based_id.instance, id).unwrap();
        env.add_new_entity(entity).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(!env.has_pending_creation(id));
        assert!(!env.unregister_entity_creation_callback(id));
        assert_eq!(env.originated_entity_location(id.local), Some(1));
    }

    #[test]
    fn unregister_withdraws_callback() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        let callback: EntityCallback = Box::new(move |_: &Entity| seen.set(1));
        let event = env
            .create_entity(&mut ty, Transform::IDENTITY, Some(callback))
            .unwrap();
        assert!(env.unregister_entity_creation_callback(event.environment_based_id));
        let entity = ty
            .create_instance_unchecked(event.type_based_id.instance, event.environment_based_id)
            .unwrap();
        env.add_new_entity(entity).unwrap();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn destroy_requires_origin() {
        let mut env = env();
        assert!(matches!(
            env.destroy_entity(EnvironmentBasedId::new(2, 1), None),
            Err(WorldError::ForeignOrigin { .. })
        ));
        let event = env
            .destroy_entity(EnvironmentBasedId::new(1, 1), Some(Box::new(|_: &Entity| {})))
            .unwrap();
        assert!(env.has_pending_deletion(event.environment_based_id));
        assert!(env.unregister_entity_deletion_callback(event.environment_based_id));
        assert!(!env.unregister_entity_deletion_callback(event.environment_based_id));
    }

    #[test]
    fn deletion_callback_sees_entity() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        let id = resident(&mut env, &mut ty, 3, Vec3::ZERO);
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let callback: EntityCallback =
            Box::new(move |e: &Entity| *sink.borrow_mut() = Some(e.environment_based_id()));
        env.destroy_entity(id, Some(callback)).unwrap();
        let entity = env.remove_entity(id).unwrap();
        env.remove_deleted_entity(&entity, true);
        assert_eq!(*seen.borrow(), Some(id));
        assert!(env.originated_entity_location(3).is_none());
        assert!(entity.environment_id().is_none());
    }

    #[test]
    fn duplicate_add_is_handed_back() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        let id = resident(&mut env, &mut ty, 0, Vec3::ZERO);
        let twin = ty.create_instance_unchecked(1, id).unwrap();
        assert!(env.add_entity(twin).is_err());
        assert_eq!(env.entity_count(), 1);
    }

    #[test]
    fn moving_environment_moves_entities() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        let id = resident(&mut env, &mut ty, 0, Vec3::new(5.0, 0.0, 5.0));
        env.set_x_position(2);
        env.set_z_position(-1);
        let world = env.entity_by_environment_based_id(id).unwrap().world_transformation();
        assert!(world.position.abs_diff_eq(Vec3::new(205.0, 0.0, -95.0), 1e-4));
        assert!(env.contains_world_position(Vec3::new(250.0, 0.0, -50.0)));
        assert!(!env.contains_world_position(Vec3::new(50.0, 0.0, 50.0)));
    }

    #[test]
    fn coordinate_conversion_round_trips() {
        let env = Environment::new(1, 2, 3, 1, 1, GridSpacing::new(10, 20));
        let world = Transform::from_position(Vec3::new(25.0, 1.0, 61.0));
        let local = env.convert_world_to_environment(&world);
        assert!(local.position.abs_diff_eq(Vec3::new(5.0, 1.0, 1.0), 1e-4));
        assert!(env.convert_environment_to_world(&local).abs_diff_eq(&world, 1e-4));
        assert_eq!(env.world_position_of_tile(0, 0), Vec3::new(25.0, 0.0, 70.0));
    }

    #[test]
    fn ray_picks_nearest_movable_entity() {
        let (_log, sg) = CallLog::shared();
        let mut env = env();
        env.set_scene_graph(Some(sg));
        let mut ty = EntityType::new(1, "ball");
        ty.set_model(Some(Box::new(crate::model::FileModel::new("ball.wrl", Default::default()))));
        let near = resident(&mut env, &mut ty, 0, Vec3::new(0.0, 0.0, -5.0));
        let far = resident(&mut env, &mut ty, 1, Vec3::new(0.0, 0.0, -10.0));
        let fixed = resident(&mut env, &mut ty, 2, Vec3::new(0.0, 0.0, -2.0));
        env.entity_by_environment_based_id_mut(fixed).unwrap().set_fixed(true);

        let (hit, dist) = env.ray_intersect(Vec3::ZERO, Vec3::NEG_Z, 100.0).unwrap();
        assert_eq!(hit, near);
        assert!((dist - 5.0).abs() < 1e-4);
        assert_ne!(hit, far);
        assert!(env.ray_intersect(Vec3::ZERO, Vec3::X, 100.0).is_none());
    }

    #[test]
    fn headless_ray_finds_nothing() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        resident(&mut env, &mut ty, 0, Vec3::new(0.0, 0.0, -5.0));
        assert!(env.ray_intersect(Vec3::ZERO, Vec3::NEG_Z, 100.0).is_none());
    }

    #[test]
    fn scene_swap_reattaches_content() {
        let mut env = env();
        let mut ty = EntityType::new(1, "ball");
        env.set_tile_at_grid_position(0, 0, tile(4, 100, 100)).unwrap();
        let id = resident(&mut env, &mut ty, 0, Vec3::ZERO);
        env.set_visible(false);

        let (first, sg) = CallLog::shared();
        env.set_scene_graph(Some(sg));
        assert_eq!(first.borrow().calls[0], Call::AttachEnvironment(1));
        assert!(matches!(first.borrow().calls[1], Call::AttachTile(1, 4, _)));
        assert_eq!(first.borrow().calls[2], Call::AttachEntity(id));
        assert_eq!(first.borrow().calls[3], Call::ShowEnvironment(1, false));

        let (second, sg) = CallLog::shared();
        env.set_scene_graph(Some(sg));
        assert!(first.borrow().calls.contains(&Call::DetachEnvironment(1)));
        assert!(first.borrow().calls.contains(&Call::DetachEntity(id)));
        assert_eq!(second.borrow().calls[0], Call::AttachEnvironment(1));

        env.entity_by_environment_based_id(id).unwrap().update();
        assert_eq!(second.borrow().calls.last(), Some(&Call::UpdateEntity(id)));
    }
}
