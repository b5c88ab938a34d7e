use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use worldbase_common::{EnvironmentBasedId, EnvironmentId, Transform, TypeBasedId};

use crate::database::WorldDatabase;
use crate::error::WorldError;

/// Where an event runs once dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionScope {
    /// This peer only.
    Local,
    /// Every other peer.
    Remote,
    /// This peer and every other peer.
    Global,
}

impl ExecutionScope {
    pub fn executes_locally(self) -> bool {
        matches!(self, Self::Local | Self::Global)
    }

    pub fn sends_remotely(self) -> bool {
        matches!(self, Self::Remote | Self::Global)
    }
}

/// Bring a new entity into existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntityEvent {
    pub type_based_id: TypeBasedId,
    pub environment_based_id: EnvironmentBasedId,
    /// Relative to the origin environment.
    pub transform: Transform,
}

impl CreateEntityEvent {
    pub fn execute(&self, db: &mut WorldDatabase) -> Result<(), WorldError> {
        db.apply_create_entity(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyEntityEvent {
    pub environment_based_id: EnvironmentBasedId,
}

impl DestroyEntityEvent {
    pub fn execute(&self, db: &mut WorldDatabase) -> Result<(), WorldError> {
        db.apply_destroy_entity(self)
    }
}

/// Add an empty environment. Position is in grid coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEnvironmentEvent {
    pub id: EnvironmentId,
    pub x_position: i32,
    pub z_position: i32,
    pub x_size: u32,
    pub z_size: u32,
}

impl CreateEnvironmentEvent {
    pub fn execute(&self, db: &mut WorldDatabase) -> Result<(), WorldError> {
        db.apply_create_environment(self)
    }
}

/// Re-read the environment layout and apply it to existing environments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadEnvironmentsEvent;

impl ReloadEnvironmentsEvent {
    pub fn execute(&self, db: &mut WorldDatabase) -> Result<(), WorldError> {
        db.apply_reload_environments()
    }
}

/// Every event that mutates the world database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    CreateEntity(CreateEntityEvent),
    DestroyEntity(DestroyEntityEvent),
    CreateEnvironment(CreateEnvironmentEvent),
    ReloadEnvironments(ReloadEnvironmentsEvent),
}

impl WorldEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateEntity(_) => "CreateEntity",
            Self::DestroyEntity(_) => "DestroyEntity",
            Self::CreateEnvironment(_) => "CreateEnvironment",
            Self::ReloadEnvironments(_) => "ReloadEnvironments",
        }
    }

    /// Apply the event to `db`. This is the only path that creates or
    /// destroys entities and environments.
    pub fn execute(&self, db: &mut WorldDatabase) -> Result<(), WorldError> {
        match self {
            Self::CreateEntity(e) => e.execute(db),
            Self::DestroyEntity(e) => e.execute(db),
            Self::CreateEnvironment(e) => e.execute(db),
            Self::ReloadEnvironments(e) => e.execute(db),
        }
    }

    pub fn encode(&self) -> Result<NetMessage, WorldError> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| WorldError::Encode(e.to_string()))?;
        Ok(NetMessage { payload })
    }

    pub fn decode(message: &NetMessage) -> Result<Self, WorldError> {
        ciborium::from_reader(message.payload.as_slice())
            .map_err(|e| WorldError::Decode(e.to_string()))
    }
}

impl From<CreateEntityEvent> for WorldEvent {
    fn from(e: CreateEntityEvent) -> Self {
        Self::CreateEntity(e)
    }
}

impl From<DestroyEntityEvent> for WorldEvent {
    fn from(e: DestroyEntityEvent) -> Self {
        Self::DestroyEntity(e)
    }
}

impl From<CreateEnvironmentEvent> for WorldEvent {
    fn from(e: CreateEnvironmentEvent) -> Self {
        Self::CreateEnvironment(e)
    }
}

impl From<ReloadEnvironmentsEvent> for WorldEvent {
    fn from(e: ReloadEnvironmentsEvent) -> Self {
        Self::ReloadEnvironments(e)
    }
}

/// Encoded event as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    payload: Vec<u8>,
}

impl NetMessage {
    pub fn from_bytes(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }
}

/// Outbox of dispatched events, drained by `WorldDatabase::process_events`.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: VecDeque<(WorldEvent, ExecutionScope)>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: WorldEvent, scope: ExecutionScope) {
        tracing::debug!(event = event.name(), ?scope, "event queued");
        self.pending.push_back((event, scope));
    }

    pub fn pop(&mut self) -> Option<(WorldEvent, ExecutionScope)> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(WorldEvent, ExecutionScope)> {
        self.pending.iter()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
