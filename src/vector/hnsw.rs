//! Hierarchical navigable small-world graph over L2 distance.
//!
//! A slot arena of nodes, each carrying its vector and per-layer neighbor
//! lists. Upserts tombstone the old node and reinsert, which keeps existing
//! links intact for graph connectivity; tombstones are skipped in results
//! and reclaimed by a rebuild.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::{MnemoraError, Result};

const LEVEL_RNG_SEED: u64 = 0x6d6e_6d72_6178_6931;

type NeighborList = SmallVec<[u32; 16]>;

#[derive(Debug, Clone)]
struct HnswNode {
    id: i64,
    vector: Vec<f32>,
    // neighbors[level]; length is the node's level + 1.
    neighbors: Vec<NeighborList>,
    deleted: bool,
}

/// One search hit: document id and L2 distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Document id the vector was inserted under.
    pub id: i64,
    /// Euclidean distance to the query.
    pub distance: f32,
}

#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    slot: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.total_cmp(&other.dist)
    }
}

/// An in-memory HNSW graph with an admission cap.
#[derive(Debug)]
pub struct HnswGraph {
    dims: usize,
    m: usize,
    ef_construction: usize,
    max_elements: usize,
    nodes: Vec<HnswNode>,
    id_to_slot: FxHashMap<i64, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    level_mult: f64,
    rng: ChaCha12Rng,
}

impl HnswGraph {
    /// Creates an empty graph for vectors of the given dimension.
    pub fn new(dims: usize, max_elements: usize, m: usize, ef_construction: usize) -> Self {
        Self {
            dims,
            m: m.max(2),
            ef_construction: ef_construction.max(m),
            max_elements,
            nodes: Vec::new(),
            id_to_slot: FxHashMap::default(),
            entry_point: None,
            max_level: 0,
            level_mult: 1.0 / (m.max(2) as f64).ln(),
            rng: ChaCha12Rng::seed_from_u64(LEVEL_RNG_SEED),
        }
    }

    /// Vector dimension this graph was built for.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Live (non-tombstoned) vector count.
    pub fn len(&self) -> usize {
        self.id_to_slot.len()
    }

    /// Whether the graph holds no live vectors.
    pub fn is_empty(&self) -> bool {
        self.id_to_slot.is_empty()
    }

    /// Current admission cap.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Raises the admission cap.
    pub fn resize(&mut self, new_max: usize) {
        if new_max > self.max_elements {
            self.max_elements = new_max;
        }
    }

    fn distance_sq(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }

    fn sample_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        (-uniform.ln() * self.level_mult).floor() as usize
    }

    fn max_neighbors(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    /// Inserts or replaces the vector stored under `id`.
    pub fn insert(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(MnemoraError::InvalidArgument(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dims
            )));
        }
        if let Some(slot) = self.id_to_slot.remove(&id) {
            self.nodes[slot as usize].deleted = true;
        }
        if self.len() >= self.max_elements {
            return Err(MnemoraError::InvalidArgument(
                "index at capacity; resize before inserting".into(),
            ));
        }

        let level = self.sample_level();
        let slot = self.nodes.len() as u32;
        self.nodes.push(HnswNode {
            id,
            vector: vector.to_vec(),
            neighbors: vec![NeighborList::new(); level + 1],
            deleted: false,
        });
        self.id_to_slot.insert(id, slot);

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_level = level;
            return Ok(());
        };

        // Greedy descent through the layers above the new node's level.
        for lvl in ((level + 1)..=self.max_level).rev() {
            current = self.greedy_closest(vector, current, lvl);
        }

        // Connect on each shared layer.
        for lvl in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(vector, current, self.ef_construction, lvl);
            let cap = self.max_neighbors(lvl);
            let chosen: Vec<u32> = found
                .iter()
                .filter(|c| !self.nodes[c.slot as usize].deleted)
                .take(cap)
                .map(|c| c.slot)
                .collect();
            for &neighbor in &chosen {
                self.nodes[slot as usize].neighbors[lvl].push(neighbor);
                self.link_back(neighbor, slot, lvl);
            }
            if let Some(closest) = chosen.first() {
                current = *closest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(slot);
        }
        Ok(())
    }

    fn link_back(&mut self, from: u32, to: u32, level: usize) {
        let cap = self.max_neighbors(level);
        if self.nodes[from as usize].neighbors[level].contains(&to) {
            return;
        }
        self.nodes[from as usize].neighbors[level].push(to);
        if self.nodes[from as usize].neighbors[level].len() <= cap {
            return;
        }
        // Keep the closest `cap` links.
        let from_vec = self.nodes[from as usize].vector.clone();
        let links: Vec<u32> = self.nodes[from as usize].neighbors[level].to_vec();
        let mut scored: Vec<(f32, u32)> = links
            .into_iter()
            .map(|slot| {
                (
                    self.distance_sq(&from_vec, &self.nodes[slot as usize].vector),
                    slot,
                )
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.nodes[from as usize].neighbors[level] =
            scored.into_iter().take(cap).map(|(_, s)| s).collect();
    }

    fn greedy_closest(&self, query: &[f32], entry: u32, level: usize) -> u32 {
        let mut current = entry;
        let mut current_dist = self.distance_sq(query, &self.nodes[current as usize].vector);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[current as usize].neighbors[level] {
                let d = self.distance_sq(query, &self.nodes[neighbor as usize].vector);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, level: usize) -> Vec<Candidate> {
        let mut visited: FxHashSet<u32> = FxHashSet::default();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let entry_dist = self.distance_sq(query, &self.nodes[entry as usize].vector);
        visited.insert(entry);
        candidates.push(Reverse(Candidate {
            dist: entry_dist,
            slot: entry,
        }));
        results.push(Candidate {
            dist: entry_dist,
            slot: entry,
        });

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(farthest) = results.peek() {
                if results.len() >= ef && current.dist > farthest.dist {
                    break;
                }
            }
            let slot = current.slot as usize;
            if level >= self.nodes[slot].neighbors.len() {
                continue;
            }
            for &neighbor in &self.nodes[slot].neighbors[level] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance_sq(query, &self.nodes[neighbor as usize].vector);
                let admit = results.len() < ef
                    || results.peek().map(|f| d < f.dist).unwrap_or(true);
                if admit {
                    candidates.push(Reverse(Candidate {
                        dist: d,
                        slot: neighbor,
                    }));
                    results.push(Candidate {
                        dist: d,
                        slot: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_vec();
        out.sort_by(|a, b| a.dist.total_cmp(&b.dist));
        out
    }

    /// The `top_k` nearest live vectors to the query.
    pub fn search(&self, query: &[f32], top_k: usize, ef_search: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dims {
            return Err(MnemoraError::InvalidArgument(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dims
            )));
        }
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        let mut current = entry;
        for lvl in (1..=self.max_level).rev() {
            current = self.greedy_closest(query, current, lvl);
        }
        let ef = ef_search.max(top_k);
        let found = self.search_layer(query, current, ef, 0);
        Ok(found
            .into_iter()
            .filter(|c| !self.nodes[c.slot as usize].deleted)
            .take(top_k)
            .map(|c| Neighbor {
                id: self.nodes[c.slot as usize].id,
                distance: c.dist.sqrt(),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Persistence

    /// Serializes the graph to its single-file binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MNVX");
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(self.dims as u32).to_le_bytes());
        out.extend_from_slice(&(self.m as u32).to_le_bytes());
        out.extend_from_slice(&(self.ef_construction as u32).to_le_bytes());
        out.extend_from_slice(&(self.max_elements as u64).to_le_bytes());
        out.extend_from_slice(&(self.nodes.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.max_level as u32).to_le_bytes());
        let entry = self.entry_point.map(u64::from).unwrap_or(u64::MAX);
        out.extend_from_slice(&entry.to_le_bytes());
        for node in &self.nodes {
            out.extend_from_slice(&node.id.to_le_bytes());
            out.push(u8::from(node.deleted));
            out.extend_from_slice(&(node.neighbors.len() as u32).to_le_bytes());
            for value in &node.vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
            for level in &node.neighbors {
                out.extend_from_slice(&(level.len() as u32).to_le_bytes());
                for &slot in level {
                    out.extend_from_slice(&slot.to_le_bytes());
                }
            }
        }
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Deserializes a graph; any structural damage is `Corruption`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if bytes.len() < 4 + 2 + 4 {
            return Err(MnemoraError::Corruption("vector index file truncated".into()));
        }
        let body_len = bytes
            .len()
            .checked_sub(4)
            .ok_or_else(|| MnemoraError::Corruption("vector index file truncated".into()))?;
        let stored = u32::from_le_bytes([
            bytes[body_len],
            bytes[body_len + 1],
            bytes[body_len + 2],
            bytes[body_len + 3],
        ]);
        if crc32fast::hash(&bytes[..body_len]) != stored {
            return Err(MnemoraError::Corruption(
                "vector index checksum mismatch".into(),
            ));
        }
        let reader_bytes = &bytes[..body_len];
        reader.bytes = reader_bytes;

        if reader.take(4)? != b"MNVX" {
            return Err(MnemoraError::Corruption("vector index bad magic".into()));
        }
        let version = reader.u16()?;
        if version != 1 {
            return Err(MnemoraError::Corruption(format!(
                "vector index unsupported version {version}"
            )));
        }
        let dims = reader.u32()? as usize;
        let m = reader.u32()? as usize;
        let ef_construction = reader.u32()? as usize;
        let max_elements = reader.u64()? as usize;
        let count = reader.u64()? as usize;
        let max_level = reader.u32()? as usize;
        let entry_raw = reader.u64()?;

        let mut graph = HnswGraph::new(dims, max_elements, m, ef_construction);
        graph.max_level = max_level;
        graph.entry_point = if entry_raw == u64::MAX {
            None
        } else {
            Some(entry_raw as u32)
        };
        for slot in 0..count {
            let id = reader.i64()?;
            let deleted = reader.u8()? != 0;
            let levels = reader.u32()? as usize;
            let mut vector = Vec::with_capacity(dims);
            for _ in 0..dims {
                vector.push(f32::from_le_bytes(reader.take(4)?.try_into().map_err(
                    |_| MnemoraError::Corruption("vector index vector truncated".into()),
                )?));
            }
            let mut neighbors = Vec::with_capacity(levels);
            for _ in 0..levels {
                let len = reader.u32()? as usize;
                let mut list = NeighborList::with_capacity(len);
                for _ in 0..len {
                    let link = reader.u32()?;
                    if link as usize >= count {
                        return Err(MnemoraError::Corruption(
                            "vector index dangling neighbor link".into(),
                        ));
                    }
                    list.push(link);
                }
                neighbors.push(list);
            }
            if !deleted {
                graph.id_to_slot.insert(id, slot as u32);
            }
            graph.nodes.push(HnswNode {
                id,
                vector,
                neighbors,
                deleted,
            });
        }
        if let Some(entry) = graph.entry_point {
            if entry as usize >= graph.nodes.len() {
                return Err(MnemoraError::Corruption(
                    "vector index entry point out of range".into(),
                ));
            }
        }
        Ok(graph)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(MnemoraError::Corruption("vector index file truncated".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap_or([0; 2])))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap_or([0; 4])))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap_or([0; 8])))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap_or([0; 8])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis_vector(dims: usize, axis: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis % dims] = scale;
        v
    }

    #[test]
    fn nearest_neighbor_is_exact_on_small_sets() {
        let mut graph = HnswGraph::new(8, 100, 8, 64);
        for i in 0..50i64 {
            graph
                .insert(i, &basis_vector(8, i as usize, 1.0 + i as f32))
                .unwrap();
        }
        let query = basis_vector(8, 3, 4.0);
        let hits = graph.search(&query, 3, 32).unwrap();
        assert_eq!(hits[0].id, 3);
        assert!(hits[0].distance < hits[1].distance + 1e-6);
    }

    #[test]
    fn upsert_replaces_previous_vector() {
        let mut graph = HnswGraph::new(4, 10, 4, 16);
        graph.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        graph.insert(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        graph.insert(1, &[0.0, 0.0, 1.0, 0.0]).unwrap();
        assert_eq!(graph.len(), 2);

        let hits = graph.search(&[0.0, 0.0, 1.0, 0.0], 2, 16).unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn capacity_is_enforced_until_resized() {
        let mut graph = HnswGraph::new(2, 2, 4, 16);
        graph.insert(1, &[0.0, 0.0]).unwrap();
        graph.insert(2, &[1.0, 0.0]).unwrap();
        assert!(graph.insert(3, &[2.0, 0.0]).is_err());
        graph.resize(3);
        graph.insert(3, &[2.0, 0.0]).unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut graph = HnswGraph::new(4, 10, 4, 16);
        assert!(graph.insert(1, &[1.0, 2.0]).is_err());
        graph.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(graph.search(&[1.0], 1, 16).is_err());
    }

    #[test]
    fn codec_round_trips_and_search_survives() {
        let mut graph = HnswGraph::new(8, 100, 8, 64);
        for i in 0..40i64 {
            graph
                .insert(i, &basis_vector(8, i as usize, 1.0 + (i % 7) as f32))
                .unwrap();
        }
        let bytes = graph.encode();
        let restored = HnswGraph::decode(&bytes).unwrap();
        assert_eq!(restored.len(), graph.len());
        assert_eq!(restored.dims(), 8);

        let query = basis_vector(8, 5, 6.0);
        let before = graph.search(&query, 5, 32).unwrap();
        let after = restored.search(&query, 5, 32).unwrap();
        assert_eq!(
            before.iter().map(|n| n.id).collect::<Vec<_>>(),
            after.iter().map(|n| n.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn corruption_is_detected() {
        let mut graph = HnswGraph::new(4, 10, 4, 16);
        graph.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let mut bytes = graph.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = HnswGraph::decode(&bytes).unwrap_err();
        assert!(matches!(err, MnemoraError::Corruption(_)));
    }
}
