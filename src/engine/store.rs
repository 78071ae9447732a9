use std::collections::HashMap;
use std::ops::DerefMut;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify;

pub type SharedChunk = Arc<RwLock<Chunk>>;

/// Position of a `CHUNK_SIZE × CHUNK_SIZE` block of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId {
    pub cx: u32,
    pub cy: u32,
}

impl ChunkId {
    /// Row-major index. Locks are always taken in ascending index order.
    pub fn index(&self) -> usize {
        self.cy as usize * CHUNKS_PER_ROW as usize + self.cx as usize
    }

    pub fn channel(&self) -> String {
        notify::chunk_channel(self.cx, self.cy)
    }
}

/// Chunks touched by an in-grid rectangle, in ascending lock order.
pub fn chunks_for(rect: &Rect) -> Vec<ChunkId> {
    let (cx0, cx1) = (rect.x / CHUNK_SIZE, rect.max_x() / CHUNK_SIZE);
    let (cy0, cy1) = (rect.y / CHUNK_SIZE, rect.max_y() / CHUNK_SIZE);
    let mut ids = Vec::with_capacity(((cx1 - cx0 + 1) * (cy1 - cy0 + 1)) as usize);
    for cy in cy0..=cy1 {
        for cx in cx0..=cx1 {
            ids.push(ChunkId {
                cx: cx as u32,
                cy: cy as u32,
            });
        }
    }
    ids
}

/// The part of the index a spot leaves in each chunk it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub id: Ulid,
    pub rect: Rect,
}

/// Footprints of every spot touching one chunk, sorted by `rect.x`.
#[derive(Debug, Default)]
pub struct Chunk {
    footprints: Vec<Footprint>,
}

impl Chunk {
    pub fn insert(&mut self, footprint: Footprint) {
        let pos = self
            .footprints
            .partition_point(|f| f.rect.x <= footprint.rect.x);
        self.footprints.insert(pos, footprint);
    }

    /// Footprints intersecting `query`. Skips everything starting right of `query.max_x()`.
    pub fn overlapping(&self, query: &Rect) -> impl Iterator<Item = &Footprint> {
        let right_bound = self
            .footprints
            .partition_point(|f| f.rect.x <= query.max_x());
        let query = *query;
        self.footprints[..right_bound]
            .iter()
            .filter(move |f| f.rect.overlaps(&query))
    }

    pub fn len(&self) -> usize {
        self.footprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.footprints.is_empty()
    }
}

/// In-memory state of one canvas: spot records, chunk index, whitelist table.
pub struct SpotStore {
    pub(super) spots: DashMap<Ulid, Spot>,
    pub(super) chunks: Vec<SharedChunk>,
    pub(super) whitelist: Arc<RwLock<HashMap<String, u32>>>,
}

impl Default for SpotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotStore {
    pub fn new() -> Self {
        let count = (CHUNKS_PER_ROW * CHUNKS_PER_ROW) as usize;
        Self {
            spots: DashMap::new(),
            chunks: (0..count).map(|_| Arc::new(RwLock::new(Chunk::default()))).collect(),
            whitelist: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }

    pub fn get_spot(&self, id: &Ulid) -> Option<Spot> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn chunk(&self, id: ChunkId) -> SharedChunk {
        self.chunks[id.index()].clone()
    }

    /// Snapshot of every spot, in no particular order.
    pub fn all_spots(&self) -> Vec<Spot> {
        self.spots.iter().map(|e| e.value().clone()).collect()
    }

    /// Record a claim. `guards` must be the write guards of exactly the chunks
    /// `chunks_for(&spot.rect())` returns; the caller holds them.
    pub fn apply_claim<G>(&self, guards: &mut [G], spot: Spot)
    where
        G: DerefMut<Target = Chunk>,
    {
        let footprint = Footprint {
            id: spot.id,
            rect: spot.rect(),
        };
        self.spots.insert(spot.id, spot);
        for guard in guards.iter_mut() {
            guard.insert(footprint);
        }
    }
}

/// Apply a whitelist event to the table. Caller holds the write lock.
pub(super) fn apply_whitelist(table: &mut HashMap<String, u32>, event: &Event) {
    match event {
        Event::AllowanceGranted { wallet, allowance } => {
            table.insert(wallet.clone(), *allowance);
        }
        Event::WhitelistRevoked { wallet } => {
            table.remove(wallet);
        }
        Event::AllowanceConsumed { wallet, amount } => {
            if let Some(left) = table.get_mut(wallet) {
                *left = left.saturating_sub(*amount);
            }
        }
        Event::SpotClaimed { .. } => {}
    }
}
