use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Errors from identifier allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("id pool [{min}, {max}) is exhausted")]
    PoolExhausted { min: u32, max: u32 },
    #[error("id {0} was not allocated from this pool")]
    NotAllocated(u32),
    #[error("id {0} is already allocated")]
    AlreadyAllocated(u32),
    #[error("id {0} lies inside a carved sub-pool")]
    Reserved(u32),
    #[error("id {id} is outside pool range [{min}, {max})")]
    OutOfRange { id: u32, min: u32, max: u32 },
    #[error("no free sub-pool range [{start}, {start}+{count}) in pool")]
    SubPoolUnavailable { start: u32, count: u32 },
    #[error("sub-pool [{0}, {1}) was not carved from this pool")]
    UnknownSubPool(u32, u32),
    #[error("value {0} does not fit into a 16-bit identifier half")]
    IdOutOfRange(u32),
}

/// Integer identifier allocator over the half-open range `[min, max)`.
///
/// Direct allocations hand out the lowest free id. Sub-pools carve a
/// disjoint range out of the remaining free space; the parent remembers every
/// carve so neither later carves nor direct allocations reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPool {
    min: u32,
    max: u32,
    allocated: BTreeSet<u32>,
    /// Carved sub-ranges, sorted by start.
    carved: Vec<Range<u32>>,
}

impl IdPool {
    /// Create a pool over `[min, max)`.
    pub fn new(min: u32, max: u32) -> Self {
        assert!(min <= max, "id pool min must not exceed max");
        Self {
            min,
            max,
            allocated: BTreeSet::new(),
            carved: Vec::new(),
        }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn range(&self) -> Range<u32> {
        self.min..self.max
    }

    /// Whether `id` lies in this pool's range (allocated or not).
    pub fn contains(&self, id: u32) -> bool {
        self.range().contains(&id)
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.allocated.contains(&id)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Outstanding ids in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = u32> + '_ {
        self.allocated.iter().copied()
    }

    /// Ranges carved out of this pool, sorted by start.
    pub fn sub_pools(&self) -> &[Range<u32>] {
        &self.carved
    }

    fn carve_containing(&self, id: u32) -> Option<&Range<u32>> {
        self.carved.iter().find(|r| r.contains(&id))
    }

    fn carve_overlapping(&self, window: &Range<u32>) -> Option<&Range<u32>> {
        self.carved
            .iter()
            .find(|r| r.start < window.end && window.start < r.end)
    }

    /// Allocate the lowest free id.
    pub fn alloc_entry(&mut self) -> Result<u32, IdError> {
        let mut candidate = self.min;
        while candidate < self.max {
            if let Some(carve) = self.carve_containing(candidate) {
                candidate = carve.end;
                continue;
            }
            if self.allocated.contains(&candidate) {
                candidate += 1;
                continue;
            }
            self.allocated.insert(candidate);
            return Ok(candidate);
        }
        Err(IdError::PoolExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Allocate a specific id.
    pub fn alloc_entry_at(&mut self, id: u32) -> Result<(), IdError> {
        if !self.contains(id) {
            return Err(IdError::OutOfRange {
                id,
                min: self.min,
                max: self.max,
            });
        }
        if self.carve_containing(id).is_some() {
            return Err(IdError::Reserved(id));
        }
        if !self.allocated.insert(id) {
            return Err(IdError::AlreadyAllocated(id));
        }
        Ok(())
    }

    /// Return `id` to the free set.
    pub fn free_entry(&mut self, id: u32) -> Result<(), IdError> {
        if self.allocated.remove(&id) {
            Ok(())
        } else {
            Err(IdError::NotAllocated(id))
        }
    }

    fn window_is_free(&self, window: &Range<u32>) -> bool {
        self.carve_overlapping(window).is_none()
            && self.allocated.range(window.clone()).next().is_none()
    }

    /// First-fit start of a free window of `count` ids, without carving it.
    pub fn unallocated_sub_pool_start(&self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let mut start = self.min;
        loop {
            let end = start.checked_add(count)?;
            if end > self.max {
                return None;
            }
            let window = start..end;
            if let Some(carve) = self.carve_overlapping(&window) {
                start = carve.end;
                continue;
            }
            if let Some(&taken) = self.allocated.range(window).next_back() {
                start = taken + 1;
                continue;
            }
            return Some(start);
        }
    }

    /// Carve `[start, start + count)` out of this pool.
    pub fn alloc_sub_pool_at(&mut self, start: u32, count: u32) -> Result<IdPool, IdError> {
        let unavailable = IdError::SubPoolUnavailable { start, count };
        let end = start.checked_add(count).ok_or(unavailable.clone())?;
        let window = start..end;
        if count == 0 || start < self.min || end > self.max || !self.window_is_free(&window) {
            return Err(unavailable);
        }
        let at = self.carved.partition_point(|r| r.start < start);
        self.carved.insert(at, window);
        tracing::debug!(start, end, "carved sub-pool");
        Ok(IdPool::new(start, end))
    }

    /// Carve the first free window of `count` ids.
    pub fn alloc_sub_pool(&mut self, count: u32) -> Result<IdPool, IdError> {
        let start = self
            .unallocated_sub_pool_start(count)
            .ok_or(IdError::SubPoolUnavailable {
                start: self.min,
                count,
            })?;
        self.alloc_sub_pool_at(start, count)
    }

    /// Give a carved range back to this pool.
    pub fn free_sub_pool(&mut self, sub: &IdPool) -> Result<(), IdError> {
        let position = self
            .carved
            .iter()
            .position(|r| r.start == sub.min && r.end == sub.max)
            .ok_or(IdError::UnknownSubPool(sub.min, sub.max))?;
        self.carved.remove(position);
        Ok(())
    }
}

/// Name to pool-owner lookup, used by peers joining a session to resolve
/// which namespace a pool belongs to.
#[derive(Debug, Clone)]
pub struct IdPoolRegistry<K> {
    entries: BTreeMap<String, K>,
}

impl<K> Default for IdPoolRegistry<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K> IdPoolRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `owner` under `name`. A repeated name is ignored with a warning.
    pub fn register(&mut self, name: impl Into<String>, owner: K) -> bool {
        let name = name.into();
        if self.entries.contains_key(&name) {
            tracing::warn!(%name, "id pool already registered, ignoring");
            return false;
        }
        tracing::debug!(%name, "registered id pool");
        self.entries.insert(name, owner);
        true
    }

    pub fn lookup(&self, name: &str) -> Option<&K> {
        self.entries.get(name)
    }

    pub fn unregister(&mut self, name: &str) -> Option<K> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
