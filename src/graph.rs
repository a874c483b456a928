use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::config::GraphConfig;
use crate::store::models::EngagementKind;
use crate::store::{DbError, Store};

/// A node in the multi-layer graph. Artists are users wearing their
/// creator hat, so the same platform id can appear as both kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    Track(i64),
    User(i64),
    Artist(i64),
}

impl NodeKey {
    pub fn id(&self) -> i64 {
        match self {
            Self::Track(id) | Self::User(id) | Self::Artist(id) => *id,
        }
    }

    /// Parse "track:123", "user:5", "artist:9"; a bare number is a track.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Ok(id) = input.parse::<i64>() {
            return (id > 0).then_some(Self::Track(id));
        }
        let (kind, id) = input.split_once(':')?;
        let id = id.parse::<i64>().ok().filter(|id| *id > 0)?;
        match kind {
            "track" => Some(Self::Track(id)),
            "user" => Some(Self::User(id)),
            "artist" => Some(Self::Artist(id)),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track(id) => write!(f, "track:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Artist(id) => write!(f, "artist:{id}"),
        }
    }
}

/// The four edge layers. Engagement and artist relationships are directed
/// and typed; co-occurrence and similarity are undirected with a stored
/// weight. All edges are inserted in both directions for traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Cooccurrence,
    Engagement,
    UserSimilarity,
    ArtistRelationship,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::Cooccurrence,
        Layer::Engagement,
        Layer::UserSimilarity,
        Layer::ArtistRelationship,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cooccurrence => "cooccurrence",
            Self::Engagement => "engagement",
            Self::UserSimilarity => "similarity",
            Self::ArtistRelationship => "artist",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "cooccurrence" | "cooccur" => Some(Self::Cooccurrence),
            "engagement" => Some(Self::Engagement),
            "similarity" => Some(Self::UserSimilarity),
            "artist" => Some(Self::ArtistRelationship),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: NodeKey,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub layer: Layer,
    /// Edge type within the layer: like/repost/play, similar,
    /// collaboration/co_library, cooccur.
    pub relation: String,
    pub weight: f64,
}

/// A ranked neighbor of a node.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub key: NodeKey,
    pub label: String,
    pub layer: Layer,
    pub relation: String,
    pub weight: f64,
}

/// One hop of a path; `layer` is None on the source node.
#[derive(Debug, Clone, PartialEq)]
pub struct PathStep {
    pub node: NodeKey,
    pub layer: Option<Layer>,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub track_id: i64,
    pub title: String,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub track_nodes: usize,
    pub user_nodes: usize,
    pub artist_nodes: usize,
}

/// In-memory multi-relation view over a bounded neighborhood of the
/// store. Built on demand, never persisted.
pub struct GraphView<'a> {
    store: &'a Store,
    graph: DiGraph<GraphNode, GraphEdge>,
    node_index: HashMap<NodeKey, NodeIndex>,
}

impl<'a> GraphView<'a> {
    /// BFS from the seed node up to `max_depth` hops and `max_nodes`
    /// nodes, pulling each layer's neighborhood from the store.
    pub fn build(store: &'a Store, seed: NodeKey, config: &GraphConfig) -> Result<Self, DbError> {
        let mut view = Self {
            store,
            graph: DiGraph::new(),
            node_index: HashMap::new(),
        };

        let per_node = config.neighbors_per_node;
        let mut expanded: HashSet<NodeKey> = HashSet::new();
        let mut edge_seen: HashSet<(NodeKey, NodeKey, Layer, String)> = HashSet::new();
        let mut queue: VecDeque<(NodeKey, usize)> = VecDeque::new();

        view.ensure_node(seed)?;
        queue.push_back((seed, 0));

        while let Some((key, depth)) = queue.pop_front() {
            if !expanded.insert(key) || depth >= config.max_depth {
                continue;
            }
            if view.graph.node_count() >= config.max_nodes {
                break;
            }

            let mut links: Vec<(NodeKey, Layer, String, f64)> = Vec::new();
            match key {
                NodeKey::Track(track_id) => {
                    for row in store.cooccurrences_for(track_id, per_node)? {
                        links.push((
                            NodeKey::Track(row.track_id),
                            Layer::Cooccurrence,
                            "cooccur".to_string(),
                            row.weight,
                        ));
                    }
                    for engager in store.query_engagers(track_id, None, per_node)? {
                        links.push((
                            NodeKey::User(engager.user_id),
                            Layer::Engagement,
                            engager.kind.as_str().to_string(),
                            1.0,
                        ));
                    }
                    // The owning artist anchors the artist layer for this
                    // neighborhood; it connects through its relationships.
                    if let Some(track) = store.get_track(track_id)? {
                        if let Some(artist_id) = track.artist_id {
                            view.ensure_node(NodeKey::Artist(artist_id))?;
                            queue.push_back((NodeKey::Artist(artist_id), depth + 1));
                        }
                    }
                }
                NodeKey::User(user_id) => {
                    for track_id in store.query_user_library(user_id, per_node)? {
                        links.push((
                            NodeKey::Track(track_id),
                            Layer::Engagement,
                            EngagementKind::Like.as_str().to_string(),
                            1.0,
                        ));
                    }
                    for similar in store.similar_users_for(user_id, 0.0, per_node)? {
                        links.push((
                            NodeKey::User(similar.user_id),
                            Layer::UserSimilarity,
                            "similar".to_string(),
                            similar.score,
                        ));
                    }
                }
                NodeKey::Artist(artist_id) => {
                    for related in store.related_artists_for(artist_id, per_node)? {
                        links.push((
                            NodeKey::Artist(related.artist_id),
                            Layer::ArtistRelationship,
                            related.kind.as_str().to_string(),
                            related.strength,
                        ));
                    }
                }
            }

            for (other, layer, relation, weight) in links {
                if view.graph.node_count() >= config.max_nodes
                    && !view.node_index.contains_key(&other)
                {
                    continue;
                }
                let pair = if key <= other {
                    (key, other, layer, relation.clone())
                } else {
                    (other, key, layer, relation.clone())
                };
                if !edge_seen.insert(pair) {
                    continue;
                }
                let a = view.ensure_node(key)?;
                let b = view.ensure_node(other)?;
                let edge = GraphEdge {
                    layer,
                    relation: relation.clone(),
                    weight,
                };
                view.graph.add_edge(a, b, edge.clone());
                view.graph.add_edge(b, a, edge);
                queue.push_back((other, depth + 1));
            }
        }

        Ok(view)
    }

    fn ensure_node(&mut self, key: NodeKey) -> Result<NodeIndex, DbError> {
        if let Some(&idx) = self.node_index.get(&key) {
            return Ok(idx);
        }
        let label = match key {
            NodeKey::Track(id) => self
                .store
                .get_track(id)?
                .map(|t| t.title)
                .unwrap_or_else(|| format!("track {id}")),
            NodeKey::User(id) | NodeKey::Artist(id) => self
                .store
                .get_user(id)?
                .map(|u| u.username)
                .unwrap_or_else(|| format!("user {id}")),
        };
        let idx = self.graph.add_node(GraphNode { key, label });
        self.node_index.insert(key, idx);
        Ok(idx)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.node_index.contains_key(&key)
    }

    /// Edges touching a node, ranked by weight descending; ties break on
    /// the target key ascending for determinism.
    pub fn neighbors(
        &self,
        key: NodeKey,
        layer_filter: Option<Layer>,
        limit: usize,
    ) -> Vec<Neighbor> {
        let Some(&idx) = self.node_index.get(&key) else {
            return Vec::new();
        };
        let mut neighbors: Vec<Neighbor> = self
            .graph
            .edges(idx)
            .filter(|edge| layer_filter.is_none_or(|layer| edge.weight().layer == layer))
            .map(|edge| {
                let target = &self.graph[edge.target()];
                let payload = edge.weight();
                Neighbor {
                    key: target.key,
                    label: target.label.clone(),
                    layer: payload.layer,
                    relation: payload.relation.clone(),
                    weight: payload.weight,
                }
            })
            .collect();
        neighbors.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.key.cmp(&b.key))
        });
        neighbors.truncate(limit);
        neighbors
    }

    /// Best-first search across the union of allowed layers. Weighted
    /// layers cost `1/weight` per hop, engagement costs one; the result is
    /// hop-bounded. Returns None when no path exists within the bounds.
    pub fn path(
        &self,
        src: NodeKey,
        dst: NodeKey,
        max_hops: usize,
        allowed: &[Layer],
    ) -> Option<Vec<PathStep>> {
        let (&src_idx, &dst_idx) = (self.node_index.get(&src)?, self.node_index.get(&dst)?);
        if src == dst {
            return Some(vec![PathStep {
                node: src,
                layer: None,
            }]);
        }

        #[derive(PartialEq)]
        struct State {
            cost: f64,
            hops: usize,
            node: NodeIndex,
        }
        impl Eq for State {}
        impl Ord for State {
            fn cmp(&self, other: &Self) -> Ordering {
                // Min-heap: lower cost first, then fewer hops, then index
                other
                    .cost
                    .total_cmp(&self.cost)
                    .then_with(|| other.hops.cmp(&self.hops))
                    .then_with(|| other.node.index().cmp(&self.node.index()))
            }
        }
        impl PartialOrd for State {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut best: HashMap<NodeIndex, f64> = HashMap::new();
        let mut prev: HashMap<NodeIndex, (NodeIndex, Layer)> = HashMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(src_idx, 0.0);
        heap.push(State {
            cost: 0.0,
            hops: 0,
            node: src_idx,
        });

        while let Some(State { cost, hops, node }) = heap.pop() {
            if node == dst_idx {
                break;
            }
            if hops >= max_hops || best.get(&node).is_some_and(|&c| cost > c) {
                continue;
            }
            for edge in self.graph.edges(node) {
                let payload = edge.weight();
                if !allowed.contains(&payload.layer) {
                    continue;
                }
                let step_cost = match payload.layer {
                    Layer::Engagement => 1.0,
                    _ => 1.0 / payload.weight.max(1e-9),
                };
                let next_cost = cost + step_cost;
                let target = edge.target();
                if best.get(&target).is_none_or(|&c| next_cost < c) {
                    best.insert(target, next_cost);
                    prev.insert(target, (node, payload.layer));
                    heap.push(State {
                        cost: next_cost,
                        hops: hops + 1,
                        node: target,
                    });
                }
            }
        }

        if !prev.contains_key(&dst_idx) {
            return None;
        }

        let mut steps = vec![PathStep {
            node: dst,
            layer: prev.get(&dst_idx).map(|(_, layer)| *layer),
        }];
        let mut cursor = dst_idx;
        while let Some(&(from, _)) = prev.get(&cursor) {
            let layer = prev.get(&from).map(|(_, layer)| *layer);
            steps.push(PathStep {
                node: self.graph[from].key,
                layer,
            });
            cursor = from;
            if cursor == src_idx {
                break;
            }
        }
        steps.reverse();
        if steps.len() > max_hops + 1 {
            return None;
        }
        Some(steps)
    }

    /// Cross-layer recommendation for a track: co-occurring tracks, tracks
    /// liked by users similar to the seed's engagers, and tracks by
    /// artists related to the seed's artist. Per-path contributions are
    /// normalized to [0, 1] and summed.
    pub fn cross_layer_recommendation(
        &self,
        track_id: i64,
        limit: usize,
    ) -> Result<Vec<Recommendation>, DbError> {
        let mut scores: BTreeMap<i64, f64> = BTreeMap::new();

        // Channel 1: co-occurrence, normalized by the strongest candidate.
        let cooccur = self.store.cooccurrences_for(track_id, 100)?;
        let max_weight = cooccur
            .iter()
            .map(|c| c.weight)
            .fold(0.0_f64, f64::max)
            .max(1e-9);
        for row in &cooccur {
            *scores.entry(row.track_id).or_insert(0.0) += row.weight / max_weight;
        }

        // Channel 2: likes of users similar to the seed's engagers,
        // weighted by the similarity score (already in [0, 1]).
        for engager in self.store.query_engagers(track_id, None, 50)? {
            for similar in self.store.similar_users_for(engager.user_id, 0.0, 20)? {
                for liked in self.store.query_user_library(similar.user_id, 50)? {
                    *scores.entry(liked).or_insert(0.0) += similar.score;
                }
            }
        }

        // Channel 3: catalogs of artists related to the seed's artist,
        // weighted by relationship strength (already in [0, 1]).
        if let Some(artist_id) = self
            .store
            .get_track(track_id)?
            .and_then(|track| track.artist_id)
        {
            for related in self.store.related_artists_for(artist_id, 20)? {
                for other_track in self.store.tracks_by_artist(related.artist_id, 20)? {
                    *scores.entry(other_track).or_insert(0.0) += related.strength;
                }
            }
        }

        scores.remove(&track_id);

        let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);

        let mut recommendations = Vec::with_capacity(ranked.len());
        for (rec_id, score) in ranked {
            let title = self
                .store
                .get_track(rec_id)?
                .map(|t| t.title)
                .unwrap_or_else(|| format!("track {rec_id}"));
            recommendations.push(Recommendation {
                track_id: rec_id,
                title,
                score,
            });
        }
        Ok(recommendations)
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            nodes: self.graph.node_count(),
            edges: self.graph.edge_count(),
            ..Default::default()
        };
        for node in self.graph.node_weights() {
            match node.key {
                NodeKey::Track(_) => stats.track_nodes += 1,
                NodeKey::User(_) => stats.user_nodes += 1,
                NodeKey::Artist(_) => stats.artist_nodes += 1,
            }
        }
        stats
    }
}
