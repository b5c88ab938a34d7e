use std::fmt::Write as _;
use worldbase_common::{EntityTypeId, EnvironmentBasedId, IdError, Transform, TypeBasedId};
use worldbase_config::EntityTypeConfig;

use crate::entity::Entity;
use crate::events::CreateEntityEvent;
use crate::model::{Model, clone_model, model_from_config};
use crate::pools::EntityIdPools;

/// Class name of the built-in entity type.
pub const DEFAULT_ENTITY_TYPE_CLASS: &str = "EntityType";

/// Record of one live instance, kept by its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRecord {
    pub type_based_id: TypeBasedId,
    pub environment_based_id: EnvironmentBasedId,
}

/// Template and factory for entities sharing a visual template and an
/// instance id namespace.
#[derive(Debug)]
pub struct EntityType {
    id: EntityTypeId,
    name: String,
    implementation_class: String,
    fixed: bool,
    model: Option<Box<dyn Model>>,
    pools: EntityIdPools,
    global_pool_name: Option<String>,
    instances: Vec<InstanceRecord>,
}

impl EntityType {
    pub fn new(id: EntityTypeId, name: impl Into<String>) -> Self {
        let mut entity_type = Self {
            id,
            name: String::new(),
            implementation_class: DEFAULT_ENTITY_TYPE_CLASS.to_string(),
            fixed: false,
            model: None,
            pools: EntityIdPools::new(),
            global_pool_name: None,
            instances: Vec::new(),
        };
        entity_type.set_name(name);
        entity_type
    }

    /// Built-in construction from configuration.
    pub fn from_config(config: &EntityTypeConfig) -> Self {
        let mut entity_type = Self::new(config.type_id, config.name.clone());
        entity_type.implementation_class = config.implementation_class.clone();
        entity_type.fixed = config.fixed;
        entity_type.model = model_from_config(config.representation.as_ref());
        entity_type
    }

    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the type. The first call also names the global id pool, and
    /// that name sticks across later renames.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        if self.global_pool_name.is_none() {
            self.global_pool_name = Some(format!(
                "{}_globalEntityIdPool_{}",
                self.name, self.id
            ));
        }
    }

    /// Name under which the global instance-id pool is registered.
    pub fn global_entity_id_pool_name(&self) -> Option<&str> {
        self.global_pool_name.as_deref()
    }

    pub fn implementation_class(&self) -> &str {
        &self.implementation_class
    }

    pub fn set_implementation_class(&mut self, class: impl Into<String>) {
        self.implementation_class = class.into();
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

    /// Replace the template. Existing instances keep their clones until
    /// `Entity::update_visual_representation` runs.
    pub fn set_model(&mut self, model: Option<Box<dyn Model>>) {
        self.model = model;
    }

    pub fn id_pools(&self) -> &EntityIdPools {
        &self.pools
    }

    /// Install a negotiated range for runtime instance ids.
    pub fn set_local_entity_id_pool(&mut self, min: u32, max: u32) -> Result<(), IdError> {
        self.pools.set_local(min, max)
    }

    pub(crate) fn set_peer_slot(&mut self, slot: u16) {
        self.pools.set_peer_slot(slot);
    }

    /// Keep an instance id issued by another peer out of this peer's allocations.
    pub(crate) fn record_remote_instance_id(&mut self, instance: u16) {
        self.pools.record_remote(instance);
    }

    /// Recycle a reserved instance id that no record uses.
    pub(crate) fn release_unused_instance_id(&mut self, instance: u16) -> bool {
        if self.entity_by_instance_id(instance).is_some() {
            return false;
        }
        self.pools.release(instance)
    }

    /// Construct an instance with a fresh runtime id.
    pub fn create_instance(
        &mut self,
        environment_based_id: EnvironmentBasedId,
    ) -> Result<Entity, IdError> {
        let instance = self.pools.alloc_runtime()?;
        self.create_instance_unchecked(instance, environment_based_id)
    }

    /// Construct an instance with a load-time id (below 4096).
    pub fn create_instance_at_load_time(
        &mut self,
        environment_based_id: EnvironmentBasedId,
    ) -> Result<Entity, IdError> {
        let instance = self.pools.alloc_load_time()?;
        self.create_instance_unchecked(instance, environment_based_id)
    }

    /// Construct an instance with a caller-supplied id and register it.
    /// The id is not checked against the pools, only against the instances
    /// already registered.
    pub fn create_instance_unchecked(
        &mut self,
        instance: u16,
        environment_based_id: EnvironmentBasedId,
    ) -> Result<Entity, IdError> {
        if self.entity_by_instance_id(instance).is_some() {
            tracing::warn!(entity_type = self.id, instance, "instance id already in use");
            return Err(IdError::AlreadyAllocated(u32::from(instance)));
        }
        let type_based_id = TypeBasedId::new(self.id, instance);
        self.instances.push(InstanceRecord {
            type_based_id,
            environment_based_id,
        });
        tracing::debug!(%type_based_id, %environment_based_id, "created instance");
        Ok(Entity::new(
            type_based_id,
            environment_based_id,
            self.fixed,
            self.model.as_deref().map(clone_model),
        ))
    }

    /// Reserve a runtime instance id and describe the entity to create.
    pub fn create_entity_creation_event(
        &mut self,
        environment_based_id: EnvironmentBasedId,
        transform: Transform,
    ) -> Result<CreateEntityEvent, IdError> {
        let instance = self.pools.alloc_runtime()?;
        Ok(CreateEntityEvent {
            type_based_id: TypeBasedId::new(self.id, instance),
            environment_based_id,
            transform,
        })
    }

    /// Forget an instance and recycle its id if it came from this peer's
    /// local pool. Linear in the number of instances.
    pub fn remove_instance(&mut self, type_based_id: TypeBasedId) -> bool {
        match self
            .instances
            .iter()
            .position(|r| r.type_based_id == type_based_id)
        {
            Some(index) => {
                self.instances.remove(index);
                self.pools.release(type_based_id.instance);
                true
            }
            None => {
                tracing::error!(
                    %type_based_id,
                    entity_type = self.id,
                    "instance not found in entity type"
                );
                false
            }
        }
    }

    pub fn entity_by_instance_id(&self, instance: u16) -> Option<EnvironmentBasedId> {
        self.instances
            .iter()
            .find(|r| r.type_based_id.instance == instance)
            .map(|r| r.environment_based_id)
    }

    pub fn entity_by_environment_based_id(&self, id: EnvironmentBasedId) -> Option<TypeBasedId> {
        self.instances
            .iter()
            .find(|r| r.environment_based_id == id)
            .map(|r| r.type_based_id)
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn clear_instances(&mut self) {
        for record in std::mem::take(&mut self.instances) {
            self.pools.release(record.type_based_id.instance);
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "EntityType {} '{}' class={} fixed={} instances={}",
            self.id,
            self.name,
            self.implementation_class,
            self.fixed,
            self.instances.len()
        );
        for r in &self.instances {
            let _ = writeln!(out, "  {} -> {}", r.type_based_id, r.environment_based_id);
        }
        out
    }
}
