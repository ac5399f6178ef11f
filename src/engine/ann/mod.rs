// ── kmem: Vector Index (Vamana-style ANN) ──────────────────────────────────
//
// A single-layer proximity graph:
//   • greedy beam search from an entry point (the medoid),
//   • α-RNG robust pruning bounds every out-degree at `max_degree`,
//   • incremental inserts link a new node through the same search + prune,
//   • updates and removals are soft deletes; tombstoned nodes keep routing
//     until the next compaction.
//
// Vectors are L2-normalized on the way in, so similarity is a dot product.
// Small indexes (≤ exact_search_threshold live vectors) skip the graph and
// scan exhaustively.
//
// The index is a cache: the store can always rebuild it from decrypted rows.

pub mod distance;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::atoms::error::{EngineError, EngineResult, FormatError};
use crate::atoms::types::AnnStats;
use crate::engine::config::AnnConfig;
use distance::{distance, dot, normalize};

/// Compact once this share of physical slots is tombstoned.
const COMPACTION_RATIO: f32 = 0.30;
/// Below this many physical slots compaction is not worth it.
const COMPACTION_MIN_SLOTS: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    item_id: String,
    vector: Vec<f32>,
    neighbors: Vec<u32>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    slot: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Serializable adjacency for the optional `ann_index` snapshot block.
/// Neighbor ids index into `nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnGraph {
    pub dimension: usize,
    pub entry: Option<u32>,
    pub nodes: Vec<AnnGraphNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnGraphNode {
    pub item_id: String,
    pub neighbors: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    config: AnnConfig,
    dimension: usize,
    nodes: Vec<Node>,
    /// Live item id → slot.
    live: HashMap<String, u32>,
    entry: Option<u32>,
    deleted: usize,
    incremental_inserts: usize,
    is_indexed: bool,
    last_rebuild_time: Option<DateTime<Utc>>,
}

impl VectorIndex {
    pub fn new(config: AnnConfig, dimension: usize) -> Self {
        Self {
            config,
            dimension,
            nodes: Vec::new(),
            live: HashMap::new(),
            entry: None,
            deleted: 0,
            incremental_inserts: 0,
            is_indexed: false,
            last_rebuild_time: None,
        }
    }

    /// Build a fresh index over `items`. Used to stage an index before it
    /// replaces a live one.
    pub fn build(
        config: AnnConfig,
        dimension: usize,
        items: Vec<(String, Vec<f32>)>,
    ) -> EngineResult<Self> {
        let mut index = Self::new(config, dimension);
        index.rebuild(items)?;
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.live.contains_key(item_id)
    }

    fn check_dimension(&self, vector: &[f32]) -> EngineResult<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::dimension(self.dimension, vector.len()));
        }
        Ok(())
    }

    // ── Mutation ───────────────────────────────────────────────────────

    /// Add or replace one vector. On error the index is unchanged.
    pub fn insert(&mut self, item_id: &str, vector: &[f32]) -> EngineResult<()> {
        self.check_dimension(vector)?;
        let replacing = self.live.contains_key(item_id);
        if !replacing && self.live.len() >= self.config.max_elements {
            return Err(EngineError::IndexFull(self.config.max_elements));
        }
        if self.nodes.len() >= self.config.max_elements && self.deleted > 0 {
            self.compact();
        }
        if let Some(old) = self.live.remove(item_id) {
            self.tombstone(old);
        }

        let slot = self.link(item_id.to_string(), normalize(vector), self.config.alpha);
        self.live.insert(item_id.to_string(), slot);
        self.incremental_inserts += 1;
        self.is_indexed = true;
        debug!(
            "[kmem-ann] Inserted slot {} (live={}, deleted={})",
            slot,
            self.live.len(),
            self.deleted
        );
        Ok(())
    }

    /// Soft-delete. Returns whether the id was live.
    pub fn remove(&mut self, item_id: &str) -> bool {
        match self.live.remove(item_id) {
            Some(slot) => {
                self.tombstone(slot);
                if self.needs_compaction() {
                    self.compact();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every vector. The index reports unindexed until the next rebuild or insert.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.live.clear();
        self.entry = None;
        self.deleted = 0;
        self.incremental_inserts = 0;
        self.is_indexed = false;
        self.last_rebuild_time = None;
    }

    /// Discard everything and rebuild from `items`. Later duplicates win.
    /// Validation happens before any state changes.
    pub fn rebuild(&mut self, items: Vec<(String, Vec<f32>)>) -> EngineResult<()> {
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());
        let mut unique: Vec<(String, Vec<f32>)> = Vec::with_capacity(items.len());
        for (id, vector) in items {
            self.check_dimension(&vector)?;
            let vector = normalize(&vector);
            match positions.get(&id) {
                Some(&pos) => unique[pos].1 = vector,
                None => {
                    positions.insert(id.clone(), unique.len());
                    unique.push((id, vector));
                }
            }
        }
        if unique.len() > self.config.max_elements {
            return Err(EngineError::IndexFull(self.config.max_elements));
        }

        let count = unique.len();
        self.build_graph(unique);
        info!(
            "[kmem-ann] Rebuilt index: {} vectors (dim {})",
            count, self.dimension
        );
        Ok(())
    }

    fn tombstone(&mut self, slot: u32) {
        if let Some(node) = self.nodes.get_mut(slot as usize) {
            if !node.deleted {
                node.deleted = true;
                self.deleted += 1;
            }
        }
        if self.live.is_empty() {
            self.entry = None;
        }
    }

    fn needs_compaction(&self) -> bool {
        self.nodes.len() >= COMPACTION_MIN_SLOTS
            && self.deleted as f32 >= self.nodes.len() as f32 * COMPACTION_RATIO
    }

    /// Rebuild from live nodes only, reclaiming tombstoned slots.
    fn compact(&mut self) {
        let mut slots: Vec<u32> = self.live.values().copied().collect();
        slots.sort_unstable();
        let items: Vec<(String, Vec<f32>)> = slots
            .into_iter()
            .map(|s| {
                let node = &self.nodes[s as usize];
                (node.item_id.clone(), node.vector.clone())
            })
            .collect();
        let reclaimed = self.deleted;
        self.build_graph(items);
        debug!("[kmem-ann] Compacted {} tombstones", reclaimed);
    }

    // ── Graph construction ─────────────────────────────────────────────

    /// Replace all state with a freshly built graph over normalized `items`.
    fn build_graph(&mut self, items: Vec<(String, Vec<f32>)>) {
        let n = items.len();
        self.live = items
            .iter()
            .enumerate()
            .map(|(slot, (id, _))| (id.clone(), slot as u32))
            .collect();
        self.nodes = items
            .into_iter()
            .map(|(item_id, vector)| Node {
                item_id,
                vector,
                neighbors: Vec::new(),
                deleted: false,
            })
            .collect();
        self.deleted = 0;
        self.incremental_inserts = 0;
        self.is_indexed = true;
        self.last_rebuild_time = Some(Utc::now());
        self.entry = self.medoid();

        let Some(entry) = self.entry else {
            return;
        };
        if n == 1 {
            return;
        }

        // Random regular start graph, then two refinement passes
        // (α = 1 first, configured α second).
        let degree = self.config.max_degree.min(n - 1);
        let mut rng = rand::thread_rng();
        for i in 0..n {
            self.nodes[i].neighbors = sample(&mut rng, n, (degree + 1).min(n))
                .into_iter()
                .filter(|&j| j != i)
                .take(degree)
                .map(|j| j as u32)
                .collect();
        }

        for alpha in [1.0, self.config.alpha] {
            for i in 0..n {
                let slot = i as u32;
                let vector = self.nodes[i].vector.clone();
                let mut candidates = self.greedy_search(&vector, entry, self.config.search_list_size);
                candidates.extend(self.nodes[i].neighbors.iter().map(|&m| Candidate {
                    slot: m,
                    distance: distance(&vector, &self.nodes[m as usize].vector),
                }));
                let pruned = self.robust_prune(slot, candidates, alpha);
                self.nodes[i].neighbors = pruned.clone();
                for neighbor in pruned {
                    self.add_back_edge(neighbor, slot, alpha);
                }
            }
        }
    }

    /// Append a node and wire it into the graph. Returns its slot.
    fn link(&mut self, item_id: String, vector: Vec<f32>, alpha: f32) -> u32 {
        let slot = self.nodes.len() as u32;
        let neighbors = match self.entry {
            Some(entry) => {
                let candidates = self.greedy_search(&vector, entry, self.config.search_list_size);
                self.nodes.push(Node {
                    item_id,
                    vector,
                    neighbors: Vec::new(),
                    deleted: false,
                });
                self.robust_prune(slot, candidates, alpha)
            }
            None => {
                self.nodes.push(Node {
                    item_id,
                    vector,
                    neighbors: Vec::new(),
                    deleted: false,
                });
                self.entry = Some(slot);
                Vec::new()
            }
        };
        self.nodes[slot as usize].neighbors = neighbors.clone();
        for neighbor in neighbors {
            self.add_back_edge(neighbor, slot, alpha);
        }
        slot
    }

    fn add_back_edge(&mut self, from: u32, to: u32, alpha: f32) {
        let node = &mut self.nodes[from as usize];
        if node.neighbors.contains(&to) {
            return;
        }
        node.neighbors.push(to);
        if node.neighbors.len() <= self.config.max_degree {
            return;
        }

        let origin = &self.nodes[from as usize].vector;
        let candidates: Vec<Candidate> = self.nodes[from as usize]
            .neighbors
            .iter()
            .map(|&m| Candidate {
                slot: m,
                distance: distance(origin, &self.nodes[m as usize].vector),
            })
            .collect();
        let pruned = self.robust_prune(from, candidates, alpha);
        self.nodes[from as usize].neighbors = pruned;
    }

    /// α-RNG pruning: keep a candidate only if no already-kept neighbor is
    /// α-closer to it than the origin is. Distances in `candidates` are
    /// relative to the origin node `origin`.
    fn robust_prune(&self, origin: u32, mut candidates: Vec<Candidate>, alpha: f32) -> Vec<u32> {
        candidates.sort_unstable();
        candidates.dedup_by_key(|c| c.slot);

        let mut kept: Vec<u32> = Vec::with_capacity(self.config.max_degree);
        for candidate in candidates {
            if kept.len() >= self.config.max_degree {
                break;
            }
            if candidate.slot == origin || self.nodes[candidate.slot as usize].deleted {
                continue;
            }
            let vector = &self.nodes[candidate.slot as usize].vector;
            let dominated = kept.iter().any(|&k| {
                alpha * distance(&self.nodes[k as usize].vector, vector) <= candidate.distance
            });
            if !dominated {
                kept.push(candidate.slot);
            }
        }
        kept
    }

    /// Node closest to the centroid of the live vectors.
    fn medoid(&self) -> Option<u32> {
        let live: Vec<u32> = (0..self.nodes.len() as u32)
            .filter(|&s| !self.nodes[s as usize].deleted)
            .collect();
        if live.is_empty() {
            return None;
        }
        let mut centroid = vec![0.0f32; self.dimension];
        for &s in &live {
            for (c, x) in centroid.iter_mut().zip(&self.nodes[s as usize].vector) {
                *c += x;
            }
        }
        let centroid = normalize(&centroid);
        live.into_iter()
            .map(|s| Candidate {
                slot: s,
                distance: distance(&centroid, &self.nodes[s as usize].vector),
            })
            .min()
            .map(|c| c.slot)
    }

    // ── Search ─────────────────────────────────────────────────────────

    /// Best-first beam search. Returns up to `beam` candidates (tombstones
    /// included) in ascending distance order.
    fn greedy_search(&self, query: &[f32], entry: u32, beam: usize) -> Vec<Candidate> {
        let beam = beam.max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

        let start = Candidate {
            slot: entry,
            distance: distance(query, &self.nodes[entry as usize].vector),
        };
        visited.insert(entry);
        frontier.push(Reverse(start));
        best.push(start);

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = best.peek().map(|w| w.distance).unwrap_or(f32::MAX);
            if best.len() >= beam && current.distance > worst {
                break;
            }
            for &n in &self.nodes[current.slot as usize].neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let d = distance(query, &self.nodes[n as usize].vector);
                let admit = best.len() < beam || best.peek().map(|w| d < w.distance).unwrap_or(true);
                if admit {
                    let candidate = Candidate { slot: n, distance: d };
                    frontier.push(Reverse(candidate));
                    best.push(candidate);
                    if best.len() > beam {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Up to `k` `(item_id, cosine similarity)` pairs, best first.
    /// An empty or unindexed index yields an empty list.
    pub fn search(&self, query: &[f32], k: usize) -> EngineResult<Vec<(String, f32)>> {
        self.check_dimension(query)?;
        if k == 0 || self.live.is_empty() || !self.is_indexed {
            return Ok(Vec::new());
        }
        let query = normalize(query);

        let mut hits: Vec<(String, f32)> = if self.live.len() <= self.config.exact_search_threshold {
            self.live
                .iter()
                .map(|(id, &slot)| (id.clone(), dot(&query, &self.nodes[slot as usize].vector)))
                .collect()
        } else {
            let Some(entry) = self.entry else {
                return Ok(Vec::new());
            };
            let beam = self.config.search_list_size.max(k) + self.deleted.min(k * 2);
            self.greedy_search(&query, entry, beam)
                .into_iter()
                .filter(|c| !self.nodes[c.slot as usize].deleted)
                .map(|c| (self.nodes[c.slot as usize].item_id.clone(), 1.0 - c.distance))
                .collect()
        };

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    // ── Introspection & persistence ────────────────────────────────────

    pub fn stats(&self) -> AnnStats {
        AnnStats {
            current_elements: self.live.len(),
            max_elements: self.config.max_elements,
            dimension: self.dimension,
            is_indexed: self.is_indexed,
            last_rebuild_time: self.last_rebuild_time,
            deleted_elements: self.deleted,
            incremental_inserts: self.incremental_inserts,
        }
    }

    /// Adjacency over live nodes only. Tombstones are compacted away first
    /// (on a copy) so the exported graph stays connected.
    pub fn export(&self) -> AnnGraph {
        if self.deleted > 0 {
            let mut copy = self.clone();
            copy.compact();
            return copy.export();
        }
        AnnGraph {
            dimension: self.dimension,
            entry: self.entry,
            nodes: self
                .nodes
                .iter()
                .map(|n| AnnGraphNode {
                    item_id: n.item_id.clone(),
                    neighbors: n.neighbors.clone(),
                })
                .collect(),
        }
    }

    /// Reinstate an exported graph over `vectors` without rebuilding.
    /// Fails unless the graph covers exactly the given ids.
    pub fn restore(
        config: AnnConfig,
        dimension: usize,
        graph: AnnGraph,
        vectors: &HashMap<String, Vec<f32>>,
    ) -> EngineResult<Self> {
        let malformed = |msg: String| EngineError::Format(FormatError::Malformed(msg));

        if graph.dimension != dimension {
            return Err(EngineError::dimension(dimension, graph.dimension));
        }
        if graph.nodes.len() != vectors.len() {
            return Err(malformed(format!(
                "ann graph has {} nodes for {} items",
                graph.nodes.len(),
                vectors.len()
            )));
        }
        if graph.nodes.len() > config.max_elements {
            return Err(EngineError::IndexFull(config.max_elements));
        }

        let n = graph.nodes.len();
        let mut index = Self::new(config, dimension);
        for (slot, node) in graph.nodes.into_iter().enumerate() {
            let vector = vectors
                .get(&node.item_id)
                .ok_or_else(|| malformed("ann graph references an unknown item".into()))?;
            index.check_dimension(vector)?;
            if node.neighbors.iter().any(|&m| m as usize >= n || m as usize == slot)
                || node.neighbors.len() > index.config.max_degree
            {
                return Err(malformed(format!("ann graph node {} has invalid edges", slot)));
            }
            if index.live.insert(node.item_id.clone(), slot as u32).is_some() {
                return Err(malformed("ann graph lists an item twice".into()));
            }
            index.nodes.push(Node {
                item_id: node.item_id,
                vector: normalize(vector),
                neighbors: node.neighbors,
                deleted: false,
            });
        }

        index.entry = match graph.entry {
            Some(e) if (e as usize) < n => Some(e),
            _ => index.medoid(),
        };
        index.is_indexed = true;
        index.last_rebuild_time = Some(Utc::now());
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config() -> AnnConfig {
        AnnConfig {
            max_elements: 1_000,
            max_degree: 12,
            search_list_size: 48,
            alpha: 1.2,
            exact_search_threshold: 256,
        }
    }

    fn graph_only() -> AnnConfig {
        AnnConfig {
            exact_search_threshold: 0,
            ..config()
        }
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<(String, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                (format!("item-{i}"), v)
            })
            .collect()
    }

    fn exact_top_k(items: &[(String, Vec<f32>)], query: &[f32], k: usize) -> Vec<String> {
        let q = normalize(query);
        let mut scored: Vec<(String, f32)> = items
            .iter()
            .map(|(id, v)| (id.clone(), dot(&q, &normalize(v))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    #[test]
    fn small_index_exact_search() {
        let mut index = VectorIndex::new(config(), 4);
        index.insert("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.insert("c", &[0.7, 0.7, 0.0, 0.0]).unwrap();

        let hits = index.search(&[0.9, 0.1, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "c");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn large_k_and_empty_index() {
        let mut index = VectorIndex::new(config(), 2);
        assert!(index.search(&[1.0, 0.0], 10).unwrap().is_empty());
        index.insert("a", &[1.0, 0.0]).unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 1_000).unwrap().len(), 1);
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_leaves_index_untouched() {
        let mut index = VectorIndex::new(config(), 3);
        index.insert("a", &[1.0, 0.0, 0.0]).unwrap();
        let err = index.insert("b", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(index.len(), 1);
        assert!(!index.contains("b"));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn update_soft_deletes_old_slot() {
        let mut index = VectorIndex::new(config(), 2);
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("a", &[0.0, 1.0]).unwrap();
        let stats = index.stats();
        assert_eq!(stats.current_elements, 1);
        assert_eq!(stats.deleted_elements, 1);
        let hits = index.search(&[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn remove_and_clear() {
        let mut index = VectorIndex::new(config(), 2);
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0]).unwrap();
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        let hits = index.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");

        index.clear();
        assert!(!index.stats().is_indexed);
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut index = VectorIndex::new(
            AnnConfig {
                max_elements: 2,
                ..config()
            },
            2,
        );
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0]).unwrap();
        assert!(matches!(index.insert("c", &[1.0, 1.0]), Err(EngineError::IndexFull(2))));
        // Replacing an existing id compacts tombstones instead of failing.
        index.insert("a", &[0.5, 0.5]).unwrap();
        index.insert("a", &[0.6, 0.4]).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn graph_search_recall() {
        let items = random_vectors(400, 16, 7);
        let index = VectorIndex::build(graph_only(), 16, items.clone()).unwrap();
        assert!(index.stats().last_rebuild_time.is_some());

        let queries = random_vectors(20, 16, 99);
        let k = 10;
        let mut found = 0;
        for (_, q) in &queries {
            let truth = exact_top_k(&items, q, k);
            let hits = index.search(q, k).unwrap();
            assert_eq!(hits.len(), k);
            found += hits.iter().filter(|(id, _)| truth.contains(id)).count();
        }
        let recall = found as f32 / (queries.len() * k) as f32;
        assert!(recall >= 0.9, "recall@10 was {recall}");
    }

    #[test]
    fn degrees_stay_bounded() {
        let items = random_vectors(300, 8, 3);
        let mut index = VectorIndex::build(graph_only(), 8, items[..150].to_vec()).unwrap();
        for (id, v) in &items[150..] {
            index.insert(id, v).unwrap();
        }
        assert!(index.nodes.iter().all(|n| n.neighbors.len() <= 12));
        assert_eq!(index.stats().incremental_inserts, 150);
    }

    #[test]
    fn incremental_inserts_are_findable() {
        let items = random_vectors(300, 16, 11);
        let mut index = VectorIndex::new(graph_only(), 16);
        for (id, v) in &items {
            index.insert(id, v).unwrap();
        }
        let self_hits = items
            .iter()
            .filter(|(id, v)| index.search(v, 1).unwrap()[0].0 == *id)
            .count();
        assert!(self_hits >= 285, "only {self_hits}/300 found themselves");
    }

    #[test]
    fn deletions_trigger_compaction() {
        let items = random_vectors(100, 4, 5);
        let mut index = VectorIndex::build(graph_only(), 4, items.clone()).unwrap();
        for (id, _) in &items[..40] {
            index.remove(id);
        }
        let stats = index.stats();
        assert_eq!(stats.current_elements, 60);
        assert!(stats.deleted_elements < 40);
        let hits = index.search(&items[50].1, 60).unwrap();
        assert!(hits.iter().all(|(id, _)| !items[..40].iter().any(|(d, _)| d == id)));
    }

    #[test]
    fn export_restore_preserves_results() {
        let items = random_vectors(120, 8, 21);
        let mut index = VectorIndex::build(graph_only(), 8, items.clone()).unwrap();
        index.remove("item-0");

        let graph = index.export();
        assert_eq!(graph.nodes.len(), 119);

        let vectors: HashMap<String, Vec<f32>> = items[1..].iter().cloned().collect();
        let restored = VectorIndex::restore(graph_only(), 8, graph.clone(), &vectors).unwrap();
        assert_eq!(restored.len(), 119);
        let q = &items[10].1;
        assert_eq!(restored.search(q, 1).unwrap()[0].0, "item-10");

        let mut short = vectors.clone();
        short.remove("item-5");
        assert!(VectorIndex::restore(graph_only(), 8, graph, &short).is_err());
    }

    #[test]
    fn rebuild_validates_before_mutating() {
        let mut index = VectorIndex::new(config(), 2);
        index.insert("keep", &[1.0, 0.0]).unwrap();
        let bad = vec![("x".to_string(), vec![1.0, 0.0]), ("y".to_string(), vec![1.0])];
        assert!(index.rebuild(bad).is_err());
        assert!(index.contains("keep"));
    }
}
