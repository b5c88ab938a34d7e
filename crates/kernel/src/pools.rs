use worldbase_common::{IdError, IdPool};

/// Size of the 16-bit local id space.
pub const ID_SPACE: u32 = 1 << 16;

/// Ids below this bound are reserved for entities present at world-load time.
pub const LOAD_TIME_ID_COUNT: u32 = 4096;

/// Width of the runtime chunk a peer carves for its own allocations.
pub const LOCAL_CHUNK: u32 = 4096;

/// Owner of a named pool in the database's pool registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOwner {
    EntityType(u16),
    Environment(u16),
}

fn narrow(id: u32) -> Result<u16, IdError> {
    u16::try_from(id).map_err(|_| IdError::IdOutOfRange(id))
}

/// Start of the aligned runtime chunk holding `id`.
fn chunk_start(id: u32) -> u32 {
    LOAD_TIME_ID_COUNT + (id - LOAD_TIME_ID_COUNT) / LOCAL_CHUNK * LOCAL_CHUNK
}

/// The three-tier id namespace shared by entity types (instance ids) and
/// environments (local entity ids).
///
/// `global` spans the full 16-bit range. `load_time` is carved from it at
/// `[0, 4096)`. `local` is one `LOCAL_CHUNK`-wide chunk carved on the first
/// runtime allocation, at the chunk matching the peer slot when that one is
/// free, unless a negotiated pool was installed before. Ids issued by other
/// peers are recorded in `remote` so this peer never hands them out again.
#[derive(Debug, Clone)]
pub struct EntityIdPools {
    global: IdPool,
    load_time: IdPool,
    local: Option<IdPool>,
    remote: Vec<IdPool>,
    peer_slot: u16,
}

impl Default for EntityIdPools {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIdPools {
    pub fn new() -> Self {
        let mut global = IdPool::new(0, ID_SPACE);
        let load_time = global
            .alloc_sub_pool_at(0, LOAD_TIME_ID_COUNT)
            .expect("a fresh 16-bit pool always has room for the load-time range");
        Self {
            global,
            load_time,
            local: None,
            remote: Vec::new(),
            peer_slot: 0,
        }
    }

    pub fn peer_slot(&self) -> u16 {
        self.peer_slot
    }

    /// Select the chunk the local pool prefers. Only affects a pool that
    /// has not been carved yet.
    pub fn set_peer_slot(&mut self, slot: u16) {
        self.peer_slot = slot;
    }

    pub fn global(&self) -> &IdPool {
        &self.global
    }

    pub fn load_time(&self) -> &IdPool {
        &self.load_time
    }

    pub fn local(&self) -> Option<&IdPool> {
        self.local.as_ref()
    }

    pub fn is_load_time(id: u16) -> bool {
        u32::from(id) < LOAD_TIME_ID_COUNT
    }

    pub fn alloc_load_time(&mut self) -> Result<u16, IdError> {
        narrow(self.load_time.alloc_entry()?)
    }

    /// Reserve a specific load-time id (configured entity ids).
    pub fn reserve_load_time(&mut self, id: u16) -> Result<(), IdError> {
        self.load_time.alloc_entry_at(u32::from(id))
    }

    fn carve_local(&mut self) -> Result<IdPool, IdError> {
        let preferred = LOAD_TIME_ID_COUNT + u32::from(self.peer_slot) * LOCAL_CHUNK;
        if preferred + LOCAL_CHUNK <= ID_SPACE {
            if let Ok(pool) = self.global.alloc_sub_pool_at(preferred, LOCAL_CHUNK) {
                return Ok(pool);
            }
        }
        let start = self
            .global
            .unallocated_sub_pool_start(LOCAL_CHUNK)
            .ok_or(IdError::PoolExhausted {
                min: self.global.min(),
                max: self.global.max(),
            })?;
        self.global.alloc_sub_pool_at(start, LOCAL_CHUNK)
    }

    fn local_pool(&mut self) -> Result<&mut IdPool, IdError> {
        if self.local.is_none() {
            let pool = self.carve_local()?;
            tracing::debug!(min = pool.min(), max = pool.max(), "carved local id pool");
            self.local = Some(pool);
        }
        self.local.as_mut().ok_or(IdError::PoolExhausted {
            min: 0,
            max: ID_SPACE,
        })
    }

    /// Allocate a runtime id from the local pool, carving it first if needed.
    pub fn alloc_runtime(&mut self) -> Result<u16, IdError> {
        narrow(self.local_pool()?.alloc_entry()?)
    }

    /// Replace the local pool with an externally negotiated range.
    pub fn set_local(&mut self, min: u32, max: u32) -> Result<(), IdError> {
        let old = self.local.take();
        if let Some(old) = &old {
            if old.allocated_count() > 0 {
                tracing::warn!(
                    outstanding = old.allocated_count(),
                    "replacing local id pool with outstanding ids"
                );
            }
            self.global.free_sub_pool(old)?;
        }
        match self.global.alloc_sub_pool_at(min, max.saturating_sub(min)) {
            Ok(pool) => {
                self.local = Some(pool);
                Ok(())
            }
            Err(err) => {
                if let Some(old) = old {
                    self.global
                        .alloc_sub_pool_at(old.min(), old.max() - old.min())?;
                    self.local = Some(old);
                }
                Err(err)
            }
        }
    }

    /// Give back a runtime id this peer allocated. Load-time ids and ids
    /// allocated by other peers are not recycled; returns whether it was freed.
    pub fn release(&mut self, id: u16) -> bool {
        match self.local.as_mut() {
            Some(pool) if pool.is_allocated(u32::from(id)) => {
                pool.free_entry(u32::from(id)).is_ok()
            }
            _ => false,
        }
    }

    /// Note a runtime id issued by another peer. The id is marked in the
    /// local pool when it falls there, otherwise the aligned chunk holding
    /// it is withdrawn from the global pool so it is never carved here.
    pub fn record_remote(&mut self, id: u16) {
        let id = u32::from(id);
        if id < LOAD_TIME_ID_COUNT {
            return;
        }
        if let Some(pool) = self.local.as_mut().filter(|pool| pool.contains(id)) {
            if !pool.is_allocated(id) {
                let _ = pool.alloc_entry_at(id);
            }
            return;
        }
        if let Some(pool) = self.remote.iter_mut().find(|pool| pool.contains(id)) {
            if !pool.is_allocated(id) {
                let _ = pool.alloc_entry_at(id);
            }
            return;
        }
        let start = chunk_start(id);
        match self.global.alloc_sub_pool_at(start, LOCAL_CHUNK) {
            Ok(mut pool) => {
                let _ = pool.alloc_entry_at(id);
                tracing::debug!(min = pool.min(), max = pool.max(), "withdrew remote id chunk");
                self.remote.push(pool);
            }
            Err(err) => tracing::debug!(id, error = %err, "remote id outside a free chunk"),
        }
    }

    /// Whether `id` was recorded as issued by another peer.
    pub fn is_remote(&self, id: u16) -> bool {
        self.remote
            .iter()
            .any(|pool| pool.is_allocated(u32::from(id)))
    }
}
