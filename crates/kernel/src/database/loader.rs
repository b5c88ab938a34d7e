//! Configuration loading and environment reload.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use worldbase_common::{EntityTypeId, EnvironmentBasedId, EnvironmentId, TileId};
use worldbase_config::{
    EntityTypeConfig, EnvironmentConfig, EnvironmentLayoutConfig, EnvironmentPlacementConfig,
    TileConfig, WorldConfig,
};

use super::{LayoutSource, WorldDatabase};
use crate::entity_type::EntityType;
use crate::environment::Environment;
use crate::error::WorldError;
use crate::events::{CreateEntityEvent, DestroyEntityEvent, ExecutionScope};
use crate::pools::EntityIdPools;
use crate::tile::Tile;

/// Reject tile maps naming negative or unknown tile ids.
fn check_tile_map(
    tiles: &BTreeMap<TileId, Tile>,
    config: &EnvironmentConfig,
) -> Result<(), WorldError> {
    for value in config.tile_map.iter().flatten().copied() {
        if value < 0 {
            return Err(WorldError::InvalidTileId(value));
        }
        if value > 0 && !tiles.contains_key(&(value as TileId)) {
            return Err(WorldError::UnknownTileId(value));
        }
    }
    Ok(())
}

/// Place a clone of the master for every non-zero map cell. Placements
/// refused for bounds, overlap or alignment are logged and skipped.
fn place_tiles(
    tiles: &BTreeMap<TileId, Tile>,
    env: &mut Environment,
    config: &EnvironmentConfig,
) -> usize {
    let mut placed = 0;
    for (z, row) in config.tile_map.iter().enumerate() {
        for (x, &value) in row.iter().enumerate() {
            let Some(master) = (value > 0).then(|| tiles.get(&(value as TileId))).flatten() else {
                continue;
            };
            match env.set_tile_at_grid_position(x as i32, z as i32, master.clone()) {
                Ok(()) => placed += 1,
                Err(err) => tracing::warn!(env = env.id(), x, z, %err, "tile placement skipped"),
            }
        }
    }
    placed
}

/// Create the configured load-time entities of a not yet registered
/// environment.
fn populate_entities(
    entity_types: &mut BTreeMap<EntityTypeId, EntityType>,
    env: &mut Environment,
    config: &EnvironmentConfig,
) -> Result<(), WorldError> {
    for entry in &config.entities {
        let id = EnvironmentBasedId::new(env.id(), entry.id);
        if !EntityIdPools::is_load_time(entry.id) {
            return Err(WorldError::InvalidConfig(format!(
                "entity {id} does not have a load-time id"
            )));
        }
        let entity_type = entity_types
            .get_mut(&entry.type_id)
            .ok_or(WorldError::UnknownEntityType(entry.type_id))?;
        env.reserve_load_time_entity_id(entry.id)?;
        let mut entity = entity_type.create_instance_at_load_time(id)?;
        entity.store_transformation(entry.transform);
        if let Err(entity) = env.add_new_entity(entity) {
            entity_type.remove_instance(entity.type_based_id());
            return Err(WorldError::DuplicateEntity(id));
        }
    }
    Ok(())
}

impl WorldDatabase {
    /// Build an entity type with the first factory that accepts its class,
    /// falling back to the built-in type.
    pub fn create_entity_type(
        &mut self,
        config: &EntityTypeConfig,
    ) -> Result<EntityTypeId, WorldError> {
        let entity_type = match self
            .entity_type_factories
            .iter()
            .find_map(|f| f.create(config))
        {
            Some(entity_type) => entity_type,
            None => {
                tracing::warn!(
                    class = %config.implementation_class,
                    id = config.type_id,
                    "no factory for entity type class, using the built-in type"
                );
                EntityType::from_config(config)
            }
        };
        let id = entity_type.id();
        self.add_entity_type(entity_type)?;
        Ok(id)
    }

    pub fn load_entity_type_configs(
        &mut self,
        configs: &[EntityTypeConfig],
    ) -> Result<usize, WorldError> {
        for config in configs {
            self.create_entity_type(config)?;
        }
        tracing::info!(count = configs.len(), "entity types loaded");
        Ok(configs.len())
    }

    pub fn load_entity_types(&mut self, path: impl AsRef<Path>) -> Result<usize, WorldError> {
        let path = path.as_ref();
        let _span = tracing::info_span!("load_entity_types", ?path).entered();
        let config = worldbase_config::load_entity_types(path).inspect_err(|err| {
            tracing::error!(%err, "entity types failed to load");
        })?;
        self.load_entity_type_configs(&config.entity_types)
    }

    pub fn load_tile_configs(&mut self, configs: &[TileConfig]) -> Result<usize, WorldError> {
        for config in configs {
            self.add_tile(Tile::from_config(config)?)?;
        }
        tracing::info!(count = configs.len(), "tiles loaded");
        Ok(configs.len())
    }

    pub fn load_tiles(&mut self, path: impl AsRef<Path>) -> Result<usize, WorldError> {
        let path = path.as_ref();
        let _span = tracing::info_span!("load_tiles", ?path).entered();
        let config = worldbase_config::load_tiles(path).inspect_err(|err| {
            tracing::error!(%err, "tiles failed to load");
        })?;
        self.load_tile_configs(&config.tiles)
    }

    /// Load an environment from in-memory configuration. Nothing is
    /// registered if any part of it fails.
    pub fn load_environment_config(
        &mut self,
        id: EnvironmentId,
        pos_x: i32,
        pos_z: i32,
        config: &EnvironmentConfig,
    ) -> Result<(), WorldError> {
        let _span = tracing::info_span!("load_environment", id).entered();
        if self.environments.contains_key(&id) {
            tracing::error!(id, "environment id already in use");
            return Err(WorldError::EnvironmentIdInUse(id));
        }
        config.validate()?;
        check_tile_map(&self.tiles, config)?;

        let mut env = Environment::new(
            id,
            pos_x,
            pos_z,
            config.x_dimension,
            config.z_dimension,
            self.spacing,
        );
        let placed = place_tiles(&self.tiles, &mut env, config);
        for entry in &config.entry_points {
            env.add_entry_point(entry.position, entry.direction);
        }
        if let Err(err) = populate_entities(&mut self.entity_types, &mut env, config) {
            tracing::error!(id, %err, "environment failed to load");
            for entity in env.take_entities() {
                if let Some(entity_type) = self.entity_types.get_mut(&entity.entity_type_id()) {
                    entity_type.remove_instance(entity.type_based_id());
                }
            }
            return Err(err);
        }
        tracing::info!(
            id,
            tiles = placed,
            entities = env.entity_count(),
            entry_points = env.entry_point_count(),
            "environment loaded"
        );
        self.insert_environment(env);
        Ok(())
    }

    pub fn load_environment(
        &mut self,
        id: EnvironmentId,
        pos_x: i32,
        pos_z: i32,
        path: impl AsRef<Path>,
    ) -> Result<(), WorldError> {
        let config = worldbase_config::load_environment(path).inspect_err(|err| {
            tracing::error!(id, %err, "environment config failed to load");
        })?;
        self.load_environment_config(id, pos_x, pos_z, &config)
    }

    fn apply_layout(
        &mut self,
        layout: &EnvironmentLayoutConfig,
        base_dir: Option<&Path>,
    ) -> Result<usize, WorldError> {
        layout.validate()?;
        self.set_spacing(layout.x_spacing, layout.z_spacing)?;
        let mut loaded = 0;
        for placement in &layout.environments {
            let result = placement
                .resolve(base_dir)
                .map_err(WorldError::from)
                .and_then(|config| {
                    let (x, z) = (placement.x_loc, placement.z_loc);
                    self.load_environment_config(placement.id, x, z, &config)
                });
            match result {
                Ok(()) => loaded += 1,
                Err(err) => tracing::error!(id = placement.id, %err, "environment skipped"),
            }
        }
        tracing::info!(loaded, listed = layout.environments.len(), "environment layout applied");
        Ok(loaded)
    }

    /// Apply an in-memory layout. Environment files are resolved against
    /// `base_dir`. Returns how many environments loaded.
    pub fn load_layout_config(
        &mut self,
        layout: &EnvironmentLayoutConfig,
        base_dir: Option<&Path>,
    ) -> Result<usize, WorldError> {
        self.layout_source = Some(LayoutSource::Inline {
            layout: layout.clone(),
            base_dir: base_dir.map(Path::to_path_buf),
        });
        self.apply_layout(layout, base_dir)
    }

    pub fn load_environment_layout(&mut self, path: impl AsRef<Path>) -> Result<usize, WorldError> {
        let path = path.as_ref();
        let _span = tracing::info_span!("load_environment_layout", ?path).entered();
        let layout = worldbase_config::load_layout(path).inspect_err(|err| {
            tracing::error!(%err, "environment layout failed to load");
        })?;
        self.layout_source = Some(LayoutSource::File(path.to_path_buf()));
        self.apply_layout(&layout, path.parent())
    }

    /// Load entity types, tiles and the environment layout, in that order.
    pub fn load_world_database(
        &mut self,
        entity_types: impl AsRef<Path>,
        tiles: impl AsRef<Path>,
        layout: impl AsRef<Path>,
    ) -> Result<usize, WorldError> {
        self.load_entity_types(entity_types)?;
        self.load_tiles(tiles)?;
        self.load_environment_layout(layout)
    }

    pub fn load_world_config(
        &mut self,
        world: &WorldConfig,
        base_dir: Option<&Path>,
    ) -> Result<usize, WorldError> {
        world.validate()?;
        self.load_entity_type_configs(&world.entity_types)?;
        self.load_tile_configs(&world.tiles)?;
        self.load_layout_config(&world.layout, base_dir)
    }

    /// Load a single-document world; environment files are relative to it.
    pub fn load_world_file(&mut self, path: impl AsRef<Path>) -> Result<usize, WorldError> {
        let path = path.as_ref();
        let world = worldbase_config::load_world(path)?;
        self.load_world_config(&world, path.parent())
    }

    pub(crate) fn apply_reload_environments(&mut self) -> Result<(), WorldError> {
        let (layout, base_dir) = match &self.layout_source {
            None => return Err(WorldError::NoLayout),
            Some(LayoutSource::File(path)) => (
                worldbase_config::load_layout(path)?,
                path.parent().map(Path::to_path_buf),
            ),
            Some(LayoutSource::Inline { layout, base_dir }) => (layout.clone(), base_dir.clone()),
        };
        let _span = tracing::info_span!("reload_environments").entered();
        let mut reloaded = 0;
        for placement in &layout.environments {
            if !self.environments.contains_key(&placement.id) {
                tracing::debug!(id = placement.id, "environment not loaded, reload skipped");
                continue;
            }
            let result = placement
                .resolve(base_dir.as_deref())
                .map_err(WorldError::from)
                .and_then(|config| self.reload_environment(placement, &config));
            match result {
                Ok(()) => reloaded += 1,
                Err(err) => tracing::error!(id = placement.id, %err, "environment reload failed"),
            }
        }
        tracing::info!(reloaded, "environments reloaded");
        Ok(())
    }

    fn reload_environment(
        &mut self,
        placement: &EnvironmentPlacementConfig,
        config: &EnvironmentConfig,
    ) -> Result<(), WorldError> {
        let env_id = placement.id;
        check_tile_map(&self.tiles, config)?;
        if let Some(entry) = config.entities.iter().find(|e| {
            !self.entity_types.contains_key(&e.type_id) || !EntityIdPools::is_load_time(e.id)
        }) {
            return Err(WorldError::InvalidConfig(format!(
                "entity {} of type {} cannot be created at load time",
                entry.id, entry.type_id
            )));
        }
        let configured: BTreeSet<u16> = config.entities.iter().map(|e| e.id).collect();
        let env = self
            .environments
            .get(&env_id)
            .ok_or(WorldError::UnknownEnvironment(env_id))?;
        let obsolete: Vec<EnvironmentBasedId> = env
            .entities()
            .map(|e| e.environment_based_id())
            .filter(|id| {
                id.origin == env_id
                    && EntityIdPools::is_load_time(id.local)
                    && !configured.contains(&id.local)
            })
            .collect();
        for id in obsolete {
            tracing::debug!(%id, "entity dropped from configuration");
            let event = DestroyEntityEvent {
                environment_based_id: id,
            };
            self.send_event(event.into(), ExecutionScope::Global);
        }

        for entry in &config.entities {
            let id = EnvironmentBasedId::new(env_id, entry.id);
            if self.dispose_entity(id, false) {
                let event = DestroyEntityEvent {
                    environment_based_id: id,
                };
                self.send_event(event.into(), ExecutionScope::Remote);
            }
            let env = self
                .environments
                .get_mut(&env_id)
                .ok_or(WorldError::UnknownEnvironment(env_id))?;
            if !env.id_pools().load_time().is_allocated(u32::from(entry.id)) {
                env.reserve_load_time_entity_id(entry.id)?;
            }
            let entity_type = self
                .entity_types
                .get_mut(&entry.type_id)
                .ok_or(WorldError::UnknownEntityType(entry.type_id))?;
            let mut entity = entity_type.create_instance_at_load_time(id)?;
            entity.store_transformation(entry.transform);
            let type_based_id = entity.type_based_id();
            if let Err(entity) = env.add_new_entity(entity) {
                entity_type.remove_instance(entity.type_based_id());
                return Err(WorldError::DuplicateEntity(id));
            }
            self.send_event(
                CreateEntityEvent {
                    type_based_id,
                    environment_based_id: id,
                    transform: entry.transform,
                }
                .into(),
                ExecutionScope::Remote,
            );
        }

        let env = self
            .environments
            .get_mut(&env_id)
            .ok_or(WorldError::UnknownEnvironment(env_id))?;
        env.clear_entry_points();
        for entry in &config.entry_points {
            env.add_entry_point(entry.position, entry.direction);
        }
        env.clear_tiles();
        let grow_x = config.x_dimension.saturating_sub(env.size_x()) as i32;
        let grow_z = config.z_dimension.saturating_sub(env.size_z()) as i32;
        if grow_x > 0 || grow_z > 0 {
            env.enlarge_environment(grow_x, grow_z);
        }
        let placed = place_tiles(&self.tiles, env, config);
        if env.x_position() != placement.x_loc {
            env.set_x_position(placement.x_loc);
        }
        if env.z_position() != placement.z_loc {
            env.set_z_position(placement.z_loc);
        }
        tracing::info!(
            id = env_id,
            tiles = placed,
            entities = config.entities.len(),
            "environment reloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorldEvent;
    use crate::scene::testing::{Call, CallLog};
    use glam::Vec3;
    use std::fs;
    use worldbase_common::Transform;

    const TYPES: &str = "\
entity_types:
  - type_id: 1
    name: ball
    representation:
      file: ball.wrl
  - type_id: 2
    name: pillar
    fixed: true
";

    const TILES: &str = "\
tiles:
  - id: 1
    name: floor
    x_size: 100
    z_size: 100
  - id: 2
    name: block
    x_size: 200
    z_size: 200
    height: 1.5
";

    const LAYOUT: &str = "\
x_spacing: 100
z_spacing: 100
environments:
  - id: 1
    x_loc: 0
    z_loc: 0
    config_file: env1.yaml
";

    const ENV1: &str = "\
x_dimension: 4
z_dimension: 3
tile_map:
  - [1, 0, 2, 0]
  - [0, 0, 0, 0]
  - [0, 0, 0, 0]
entry_points:
  - position: [50.0, 0.0, 50.0]
    direction: [0.0, 0.0, -1.0]
entities:
  - type_id: 1
    id: 1
    transform:
      position: [150.0, 0.0, 150.0]
  - type_id: 2
    id: 2
";

    fn world_dir(env1: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("types.yaml"), TYPES).unwrap();
        fs::write(dir.path().join("tiles.yaml"), TILES).unwrap();
        fs::write(dir.path().join("layout.yaml"), LAYOUT).unwrap();
        fs::write(dir.path().join("env1.yaml"), env1).unwrap();
        dir
    }

    fn load(dir: &tempfile::TempDir) -> WorldDatabase {
        let mut db = WorldDatabase::new();
        let loaded = db
            .load_world_database(
                dir.path().join("types.yaml"),
                dir.path().join("tiles.yaml"),
                dir.path().join("layout.yaml"),
            )
            .unwrap();
        assert_eq!(loaded, 1);
        db
    }

    #[test]
    fn loads_world_from_files() {
        let dir = world_dir(ENV1);
        let db = load(&dir);
        assert_eq!(db.entity_types().count(), 2);
        assert_eq!(db.tiles().count(), 2);

        let env = db.environment(1).unwrap();
        assert_eq!((env.size_x(), env.size_z()), (4, 3));
        assert_eq!(env.tile_at_grid_position(0, 0).unwrap().name(), "floor");
        assert_eq!(env.tile_at_grid_position(3, 1).unwrap().name(), "block");
        assert_eq!(env.grid().tile_count(), 2);
        assert_eq!(env.entry_point_count(), 1);

        let ball = db.entity_with_environment_id(EnvironmentBasedId::new(1, 1)).unwrap();
        assert!(u32::from(ball.instance_id()) < 4096);
        assert_eq!(ball.model().unwrap().source(), "ball.wrl");
        assert_eq!(ball.world_transformation().position, Vec3::new(150.0, 0.0, 150.0));
        let pillar = db.entity_with_environment_id(EnvironmentBasedId::new(1, 2)).unwrap();
        assert!(pillar.is_fixed());
        assert!(db.pending_events().is_empty());
    }

    #[test]
    fn loaded_environment_attaches_to_scene() {
        let dir = world_dir(ENV1);
        let (log, sg) = CallLog::shared();
        let mut db = WorldDatabase::new().with_scene_graph(sg);
        db.load_world_database(
            dir.path().join("types.yaml"),
            dir.path().join("tiles.yaml"),
            dir.path().join("layout.yaml"),
        )
        .unwrap();
        let log = log.borrow();
        let calls = &log.calls;
        assert_eq!(calls[0], Call::AttachEnvironment(1));
        assert!(calls.contains(&Call::AttachEntity(EnvironmentBasedId::new(1, 1))));
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::AttachTile(1, _, _))).count(), 2);
    }

    #[test]
    fn unknown_tile_fails_without_registering() {
        let dir = world_dir(&ENV1.replace("[1, 0, 2, 0]", "[1, 0, 9, 0]"));
        let mut db = WorldDatabase::new();
        let loaded = db
            .load_world_database(
                dir.path().join("types.yaml"),
                dir.path().join("tiles.yaml"),
                dir.path().join("layout.yaml"),
            )
            .unwrap();
        assert_eq!(loaded, 0);
        assert!(db.environment(1).is_none());
        assert_eq!(db.entity_type(1).unwrap().instance_count(), 0);
    }

    #[test]
    fn negative_tile_id_is_invalid() {
        let mut db = WorldDatabase::new();
        let config = EnvironmentConfig {
            x_dimension: 1,
            z_dimension: 1,
            tile_map: vec![vec![-3]],
            entry_points: Vec::new(),
            entities: Vec::new(),
        };
        assert!(matches!(
            db.load_environment_config(1, 0, 0, &config),
            Err(WorldError::InvalidTileId(-3))
        ));
    }

    #[test]
    fn bad_entity_rolls_back_instances() {
        let env = ENV1.replace("  - type_id: 2\n    id: 2\n", "  - type_id: 1\n    id: 1\n");
        let dir = world_dir(&env);
        let mut db = WorldDatabase::new();
        db.load_entity_types(dir.path().join("types.yaml")).unwrap();
        db.load_tiles(dir.path().join("tiles.yaml")).unwrap();
        let err = db
            .load_environment(1, 0, 0, dir.path().join("env1.yaml"))
            .unwrap_err();
        assert!(matches!(err, WorldError::Id(_)));
        assert!(db.environment(1).is_none());
        assert_eq!(db.entity_type(1).unwrap().instance_count(), 0);
    }

    #[test]
    fn overlapping_tiles_are_skipped() {
        let env = ENV1.replace("[0, 0, 0, 0]\n  - [0, 0, 0, 0]", "[0, 0, 0, 1]\n  - [0, 0, 0, 0]");
        let dir = world_dir(&env);
        let db = load(&dir);
        let env = db.environment(1).unwrap();
        assert_eq!(env.grid().tile_count(), 2);
        assert_eq!(env.tile_at_grid_position(3, 1).unwrap().name(), "block");
    }

    #[test]
    fn world_document_loads_inline() {
        let world: WorldConfig = serde_yaml::from_str(&format!(
            "{TYPES}{TILES}layout:
  x_spacing: 50
  z_spacing: 50
  environments:
    - id: 3
      x_loc: 2
      z_loc: 0
      environment:
        x_dimension: 2
        z_dimension: 1
        tile_map: [[1, 0]]
"
        ))
        .unwrap();
        let mut db = WorldDatabase::new();
        assert_eq!(db.load_world_config(&world, None).unwrap(), 1);
        let env = db.environment(3).unwrap();
        assert_eq!(env.world_transformation().position, Vec3::new(100.0, 0.0, 0.0));
        assert!(env.tile_at_grid_position(0, 0).is_none());
    }

    #[test]
    fn reload_without_layout_fails() {
        let mut db = WorldDatabase::new();
        assert!(matches!(
            WorldEvent::from(crate::events::ReloadEnvironmentsEvent).execute(&mut db),
            Err(WorldError::NoLayout)
        ));
    }

    #[test]
    fn reload_applies_changed_configuration() {
        let dir = world_dir(ENV1);
        let mut db = load(&dir);
        let runtime = db
            .create_entity(1, 1, Transform::from_position(Vec3::new(10.0, 0.0, 10.0)), None)
            .unwrap();
        db.process_events().unwrap();
        let old_pillar = db
            .entity_with_environment_id(EnvironmentBasedId::new(1, 2))
            .unwrap()
            .type_based_id();

        let changed = "\
x_dimension: 5
z_dimension: 3
tile_map:
  - [0, 1, 0, 0, 0]
  - [0, 0, 0, 0, 0]
  - [0, 0, 0, 0, 0]
entry_points:
  - position: [10.0, 0.0, 10.0]
    direction: [1.0, 0.0, 0.0]
  - position: [20.0, 0.0, 20.0]
    direction: [0.0, 0.0, 1.0]
entities:
  - type_id: 2
    id: 2
    transform:
      position: [250.0, 0.0, 50.0]
  - type_id: 1
    id: 3
";
        fs::write(dir.path().join("env1.yaml"), changed).unwrap();
        fs::write(dir.path().join("layout.yaml"), LAYOUT.replace("x_loc: 0", "x_loc: 1")).unwrap();

        db.reload_environments();
        let messages = db.process_events().unwrap();

        let env = db.environment(1).unwrap();
        assert!(env.entity_by_environment_based_id(EnvironmentBasedId::new(1, 1)).is_none());
        let pillar = env.entity_by_environment_based_id(EnvironmentBasedId::new(1, 2)).unwrap();
        assert_eq!(pillar.environment_transformation().position, Vec3::new(250.0, 0.0, 50.0));
        assert_ne!(pillar.type_based_id(), old_pillar);
        assert!(env.entity_by_environment_based_id(EnvironmentBasedId::new(1, 3)).is_some());
        assert!(env.entity_by_environment_based_id(runtime).is_some());
        assert_eq!(env.entry_point_count(), 2);
        assert_eq!(env.size_x(), 5);
        assert_eq!(env.grid().tile_count(), 1);
        assert_eq!(env.tile_at_grid_position(1, 0).unwrap().name(), "floor");
        assert_eq!(env.x_position(), 1);
        assert_eq!(db.entity_type(2).unwrap().instance_count(), 1);

        let kinds: Vec<&str> = messages
            .iter()
            .map(|m| WorldEvent::decode(m).unwrap().name())
            .collect();
        assert_eq!(
            kinds,
            vec!["DestroyEntity", "DestroyEntity", "CreateEntity", "CreateEntity"]
        );
    }

    #[test]
    fn reload_keeps_pending_callbacks() {
        let dir = world_dir(ENV1);
        let mut db = load(&dir);
        let pillar = EnvironmentBasedId::new(1, 2);
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = fired.clone();
        db.destroy_entity(pillar, Some(Box::new(move |_: &crate::entity::Entity| flag.set(true))))
            .unwrap();

        db.apply_reload_environments().unwrap();
        assert!(db.environment(1).unwrap().has_pending_deletion(pillar));
        assert!(!fired.get());

        db.process_events().unwrap();
        assert!(fired.get());
        assert!(db.entity_with_environment_id(pillar).is_none());
    }
}
