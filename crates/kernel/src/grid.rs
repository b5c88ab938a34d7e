use crate::tile::Tile;

/// A 2D cell coordinate in an environment's tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// World-unit size of one grid cell, shared by every environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpacing {
    pub x: u32,
    pub z: u32,
}

impl GridSpacing {
    pub fn new(x: u32, z: u32) -> Self {
        Self { x, z }
    }
}

impl Default for GridSpacing {
    fn default() -> Self {
        Self { x: 100, z: 100 }
    }
}

/// Why a footprint cannot be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementConflict {
    OutOfBounds,
    /// Anchor of the tile already covering a cell in the footprint.
    Occupied(CellCoord),
}

#[derive(Debug)]
struct Placed {
    tile: Tile,
    anchor: CellCoord,
    span: (u32, u32),
}

/// Tile grid of one environment.
///
/// Placed tiles live in a slot arena; each cell holds the slot index of the
/// tile covering it, so a multi-cell tile is referenced from every cell of its
/// footprint.
#[derive(Debug, Default)]
pub struct TileGrid {
    size_x: u32,
    size_z: u32,
    cells: Vec<Option<usize>>,
    slots: Vec<Option<Placed>>,
    free_slots: Vec<usize>,
}

impl TileGrid {
    pub fn new(size_x: u32, size_z: u32) -> Self {
        Self {
            size_x,
            size_z,
            cells: vec![None; (size_x as usize) * (size_z as usize)],
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn size_x(&self) -> u32 {
        self.size_x
    }

    pub fn size_z(&self) -> u32 {
        self.size_z
    }

    pub fn in_bounds(&self, c: CellCoord) -> bool {
        c.x >= 0 && c.z >= 0 && (c.x as u32) < self.size_x && (c.z as u32) < self.size_z
    }

    fn index(&self, c: CellCoord) -> Option<usize> {
        self.in_bounds(c)
            .then(|| c.z as usize * self.size_x as usize + c.x as usize)
    }

    fn slot_at(&self, c: CellCoord) -> Option<usize> {
        self.index(c).and_then(|i| self.cells[i])
    }

    /// Tile covering `c`.
    pub fn get(&self, c: CellCoord) -> Option<&Tile> {
        self.slot_at(c)
            .and_then(|s| self.slots[s].as_ref())
            .map(|p| &p.tile)
    }

    /// Anchor cell of the tile covering `c`.
    pub fn anchor_of(&self, c: CellCoord) -> Option<CellCoord> {
        self.slot_at(c)
            .and_then(|s| self.slots[s].as_ref())
            .map(|p| p.anchor)
    }

    fn footprint(anchor: CellCoord, span: (u32, u32)) -> impl Iterator<Item = CellCoord> {
        (0..span.1 as i32).flat_map(move |dz| {
            (0..span.0 as i32).map(move |dx| CellCoord::new(anchor.x + dx, anchor.z + dz))
        })
    }

    /// Check that a `span` footprint anchored at `anchor` is inside the grid
    /// and covers only empty cells.
    pub fn check(&self, anchor: CellCoord, span: (u32, u32)) -> Result<(), PlacementConflict> {
        let end_x = anchor.x as i64 + span.0 as i64;
        let end_z = anchor.z as i64 + span.1 as i64;
        if !self.in_bounds(anchor) || end_x > self.size_x as i64 || end_z > self.size_z as i64 {
            return Err(PlacementConflict::OutOfBounds);
        }
        for c in Self::footprint(anchor, span) {
            if let Some(existing) = self.anchor_of(c) {
                return Err(PlacementConflict::Occupied(existing));
            }
        }
        Ok(())
    }

    /// Write `tile` into every cell of its footprint.
    pub fn place(
        &mut self,
        anchor: CellCoord,
        span: (u32, u32),
        tile: Tile,
    ) -> Result<(), (Tile, PlacementConflict)> {
        if let Err(conflict) = self.check(anchor, span) {
            return Err((tile, conflict));
        }
        let placed = Placed { tile, anchor, span };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(placed);
                slot
            }
            None => {
                self.slots.push(Some(placed));
                self.slots.len() - 1
            }
        };
        for c in Self::footprint(anchor, span) {
            if let Some(i) = self.index(c) {
                self.cells[i] = Some(slot);
            }
        }
        Ok(())
    }

    /// Clear the footprint of the tile covering `c` and hand the tile back.
    ///
    /// # Panics
    /// If a footprint cell does not point at the tile being removed; the grid
    /// is corrupted and continuing would compound it.
    pub fn remove(&mut self, c: CellCoord) -> Option<(Tile, CellCoord)> {
        let slot = self.slot_at(c)?;
        let placed = self.slots[slot].take()?;
        for cell in Self::footprint(placed.anchor, placed.span) {
            let i = self.index(cell);
            assert!(
                i.is_some_and(|i| self.cells[i] == Some(slot)),
                "tile grid corrupted: cell ({}, {}) not owned by tile {} anchored at ({}, {})",
                cell.x,
                cell.z,
                placed.tile.id(),
                placed.anchor.x,
                placed.anchor.z
            );
            if let Some(i) = i {
                self.cells[i] = None;
            }
        }
        self.free_slots.push(slot);
        Some((placed.tile, placed.anchor))
    }

    /// Grow by `|dx| x |dz|` cells. Negative growth shifts existing content
    /// towards positive indices. Returns the applied shift.
    pub fn enlarge(&mut self, dx: i32, dz: i32) -> CellCoord {
        let mov = CellCoord::new((-dx).max(0), (-dz).max(0));
        let new_x = self.size_x + dx.unsigned_abs();
        let new_z = self.size_z + dz.unsigned_abs();
        let mut cells = vec![None; new_x as usize * new_z as usize];
        for z in 0..self.size_z as usize {
            for x in 0..self.size_x as usize {
                let target = (z + mov.z as usize) * new_x as usize + x + mov.x as usize;
                cells[target] = self.cells[z * self.size_x as usize + x];
            }
        }
        for placed in self.slots.iter_mut().flatten() {
            placed.anchor.x += mov.x;
            placed.anchor.z += mov.z;
        }
        self.cells = cells;
        self.size_x = new_x;
        self.size_z = new_z;
        mov
    }

    /// Placed tiles with their anchor cells, in slot order.
    pub fn tiles(&self) -> impl Iterator<Item = (&Tile, CellCoord)> {
        self.slots.iter().flatten().map(|p| (&p.tile, p.anchor))
    }

    pub fn tile_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Remove every tile, returning them with their anchors.
    pub fn drain(&mut self) -> Vec<(Tile, CellCoord)> {
        let drained = self
            .slots
            .drain(..)
            .flatten()
            .map(|p| (p.tile, p.anchor))
            .collect();
        self.cells.iter_mut().for_each(|c| *c = None);
        self.free_slots.clear();
        drained
    }

    /// Placed tiles with their anchor cells, mutably.
    pub(crate) fn tiles_mut(&mut self) -> impl Iterator<Item = (&mut Tile, CellCoord)> {
        self.slots
            .iter_mut()
            .flatten()
            .map(|p| (&mut p.tile, p.anchor))
    }
}
