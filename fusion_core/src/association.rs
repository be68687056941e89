//! Data association: gated score matrix, connected-component partitioning
//! (union-find), and Hungarian assignment.
//!
//! # Algorithm pipeline
//! 1. Every (track, detected object) pair that passes the class-pair gates
//!    becomes an edge of the sparse bipartite graph (the score matrix).
//! 2. Union-find splits the graph into connected components, which are
//!    independent and solved in parallel.
//! 3. Solve each component with the **Hungarian algorithm** on a square cost
//!    matrix padded with a dummy cost above every feasible cost.
//! 4. Keep only pairs that correspond to a real edge.
//!
//! Among equal-cost optima the one pairing lower track indices with lower
//! object indices wins: every edge cost carries a perturbation
//! `ε · (i − j)²` on its local indices, far below cost resolution.

use crate::{
    error::Result,
    gating::{AssociationConfig, GatingTable, SpatialGrid},
    track::Track,
    types::DetectedObject,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

const TIE_BREAK_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Bipartite graph
// ---------------------------------------------------------------------------

/// A gate-passed (track, detected object) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignEdge {
    pub track: usize,
    pub object: usize,
    /// Association cost (lower is better)
    pub cost: f64,
}

/// Sparse bipartite graph between track indices and object indices.
#[derive(Clone, Debug, Default)]
pub struct BipartiteGraph {
    pub edges: Vec<AssignEdge>,
    pub n_tracks: usize,
    pub n_objects: usize,
}

/// Rows are tracks, columns are detected objects; a missing edge is
/// infeasible.
pub type ScoreMatrix = BipartiteGraph;

impl BipartiteGraph {
    pub fn new(n_tracks: usize, n_objects: usize) -> Self {
        Self {
            edges: Vec::new(),
            n_tracks,
            n_objects,
        }
    }

    pub fn add_edge(&mut self, track: usize, object: usize, cost: f64) {
        self.edges.push(AssignEdge { track, object, cost });
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Cost of a pair, if it is feasible.
    pub fn cost(&self, track: usize, object: usize) -> Option<f64> {
        self.edges
            .iter()
            .find(|e| e.track == track && e.object == object)
            .map(|e| e.cost)
    }
}

// ---------------------------------------------------------------------------
// Connected components (union-find with path halving and union by rank)
// ---------------------------------------------------------------------------

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Tracks and objects linked by gate-passed edges, solved on their own.
#[derive(Clone, Debug, Default)]
pub struct Component {
    /// Ascending
    pub tracks: Vec<usize>,
    /// Ascending
    pub objects: Vec<usize>,
    pub edges: Vec<AssignEdge>,
}

/// Split the graph into connected components, ordered by their lowest track
/// index. Track `i` is node `i`, object `j` is node `n_tracks + j`.
pub fn partition_components(graph: &BipartiteGraph) -> Vec<Component> {
    let mut uf = UnionFind::new(graph.n_tracks + graph.n_objects);
    for e in &graph.edges {
        uf.union(e.track, graph.n_tracks + e.object);
    }

    let mut by_root: BTreeMap<usize, Component> = BTreeMap::new();
    for e in &graph.edges {
        let component = by_root.entry(uf.find(e.track)).or_default();
        component.tracks.push(e.track);
        component.objects.push(e.object);
        component.edges.push(e.clone());
    }

    let mut components: Vec<Component> = by_root.into_values().collect();
    for c in &mut components {
        c.tracks.sort_unstable();
        c.tracks.dedup();
        c.objects.sort_unstable();
        c.objects.dedup();
    }
    components.sort_by_key(|c| c.tracks.first().copied());
    components
}

// ---------------------------------------------------------------------------
// Hungarian algorithm (Kuhn-Munkres, O(n³))
// ---------------------------------------------------------------------------

/// Solve one component. Returns matched `(track, object)` pairs, each backed
/// by a real edge.
pub fn solve_component(component: &Component) -> Vec<(usize, usize)> {
    let rows = component.tracks.len();
    let cols = component.objects.len();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    let n = rows.max(cols);
    // a non-finite cost would stall the potential updates
    let edges: Vec<&AssignEdge> = component.edges.iter().filter(|e| e.cost.is_finite()).collect();
    let max_cost = edges.iter().map(|e| e.cost).fold(0.0f64, f64::max);
    // above any real pairing, including the largest tie-break offset
    let dummy_cost = 2.0 * max_cost + 1.0 + TIE_BREAK_EPSILON * (n * n) as f64;

    let row_of: HashMap<usize, usize> = component
        .tracks
        .iter()
        .enumerate()
        .map(|(local, &global)| (global, local))
        .collect();
    let col_of: HashMap<usize, usize> = component
        .objects
        .iter()
        .enumerate()
        .map(|(local, &global)| (global, local))
        .collect();

    let mut cost = vec![dummy_cost; n * n];
    let mut feasible = vec![false; n * n];
    for e in edges {
        if let (Some(&r), Some(&c)) = (row_of.get(&e.track), col_of.get(&e.object)) {
            let offset = r.abs_diff(c) as f64;
            cost[r * n + c] = e.cost + TIE_BREAK_EPSILON * offset * offset;
            feasible[r * n + c] = true;
        }
    }

    run_hungarian(&cost, n)
        .into_iter()
        .enumerate()
        .filter(|&(r, c)| r < rows && c < cols && feasible[r * n + c])
        .map(|(r, c)| (component.tracks[r], component.objects[c]))
        .collect()
}

/// Minimum-cost perfect matching on a square row-major `n × n` matrix.
/// Returns the column assigned to each row.
fn run_hungarian(cost: &[f64], n: usize) -> Vec<usize> {
    // 1-based; index 0 is the virtual start column
    let mut row_potential = vec![0.0f64; n + 1];
    let mut col_potential = vec![0.0f64; n + 1];
    // row owning each column, 0 = free
    let mut owner = vec![0usize; n + 1];
    let mut prev_col = vec![0usize; n + 1];

    for row in 1..=n {
        owner[0] = row;
        let mut col = 0usize;
        let mut slack = vec![f64::INFINITY; n + 1];
        let mut visited = vec![false; n + 1];

        // grow the alternating tree until it reaches a free column
        loop {
            visited[col] = true;
            let r = owner[col];
            let mut delta = f64::INFINITY;
            let mut next = 0;
            for c in 1..=n {
                if visited[c] {
                    continue;
                }
                let reduced = cost[(r - 1) * n + (c - 1)] - row_potential[r] - col_potential[c];
                if reduced < slack[c] {
                    slack[c] = reduced;
                    prev_col[c] = col;
                }
                if slack[c] < delta {
                    delta = slack[c];
                    next = c;
                }
            }
            for c in 0..=n {
                if visited[c] {
                    row_potential[owner[c]] += delta;
                    col_potential[c] -= delta;
                } else {
                    slack[c] -= delta;
                }
            }
            col = next;
            if owner[col] == 0 {
                break;
            }
        }

        // flip the augmenting path
        while col != 0 {
            let back = prev_col[col];
            owner[col] = owner[back];
            col = back;
        }
    }

    let mut assigned = vec![0usize; n];
    for c in 1..=n {
        if owner[c] != 0 {
            assigned[owner[c] - 1] = c - 1;
        }
    }
    assigned
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Partial injective mapping between track and object indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    /// track index → object index
    pub direct: BTreeMap<usize, usize>,
    /// object index → track index
    pub reverse: BTreeMap<usize, usize>,
}

impl Assignment {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut out = Self::default();
        for (t, m) in pairs {
            out.direct.insert(t, m);
            out.reverse.insert(m, t);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty()
    }
}

/// Gated global-nearest-neighbour association.
#[derive(Clone, Debug)]
pub struct DataAssociation {
    table: GatingTable,
}

impl DataAssociation {
    pub fn new(config: &AssociationConfig) -> Result<Self> {
        Ok(Self {
            table: GatingTable::from_config(config)?,
        })
    }

    pub fn table(&self) -> &GatingTable {
        &self.table
    }

    /// Score every feasible pair. `tracks` must already be predicted to the
    /// batch time.
    pub fn calc_score_matrix(
        &self,
        objects: &[DetectedObject],
        tracks: &[Track],
    ) -> ScoreMatrix {
        let mut graph = BipartiteGraph::new(tracks.len(), objects.len());
        if tracks.is_empty() || objects.is_empty() {
            return graph;
        }

        let mut grid = SpatialGrid::new(self.table.max_gate_distance());
        for (oi, o) in objects.iter().enumerate() {
            grid.insert(oi, o.kinematics.x, o.kinematics.y);
        }

        // collect() on an indexed parallel iterator keeps track order
        let rows: Vec<Vec<(usize, usize, f64)>> = tracks
            .par_iter()
            .enumerate()
            .map(|(ti, track)| {
                let pose = track.kinematics();
                let label = track.label();
                grid.query_nearby(pose.x, pose.y)
                    .into_iter()
                    .filter_map(|oi| {
                        self.table
                            .score(label, &pose, &track.shape, &objects[oi])
                            .map(|cost| (ti, oi, cost))
                    })
                    .collect()
            })
            .collect();

        for (ti, oi, cost) in rows.into_iter().flatten() {
            graph.add_edge(ti, oi, cost);
        }
        graph
    }

    /// Global minimum-cost assignment over the score matrix.
    pub fn assign(&self, matrix: &ScoreMatrix) -> Assignment {
        assign(matrix)
    }
}

/// Global minimum-cost assignment over a score matrix.
pub fn assign(matrix: &ScoreMatrix) -> Assignment {
    if matrix.is_empty() {
        return Assignment::default();
    }
    let components = partition_components(matrix);
    let pairs: Vec<Vec<(usize, usize)>> = components.par_iter().map(solve_component).collect();
    Assignment::from_pairs(pairs.into_iter().flatten())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hungarian_3x3_known() {
        // optimum: (0,1) + (1,0) + (2,2) = 1 + 2 + 2
        #[rustfmt::skip]
        let cost = [
            4.0, 1.0, 3.0,
            2.0, 0.0, 5.0,
            3.0, 2.0, 2.0,
        ];
        let columns = run_hungarian(&cost, 3);
        assert_eq!(columns, vec![1, 0, 2]);
    }

    #[test]
    fn chained_edges_form_one_component() {
        let mut graph = BipartiteGraph::new(3, 3);
        graph.add_edge(0, 0, 1.0);
        graph.add_edge(1, 0, 1.0);
        graph.add_edge(1, 2, 1.0);
        let comps = partition_components(&graph);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].tracks, vec![0, 1]);
        assert_eq!(comps[0].objects, vec![0, 2]);
    }

    #[test]
    fn partition_two_independent_components() {
        let mut graph = BipartiteGraph::new(4, 4);
        graph.add_edge(2, 3, 2.0);
        graph.add_edge(0, 0, 1.0);

        let comps = partition_components(&graph);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].tracks, vec![0]);
        assert_eq!(comps[1].tracks, vec![2]);
    }

    #[test]
    fn crossing_costs_pick_the_cheaper_diagonal() {
        let mut graph = BipartiteGraph::new(2, 2);
        graph.add_edge(0, 0, 1.0);
        graph.add_edge(0, 1, 10.0);
        graph.add_edge(1, 0, 10.0);
        graph.add_edge(1, 1, 1.0);
        let a = assign(&graph);
        assert_eq!(a.direct, BTreeMap::from([(0, 0), (1, 1)]));
        assert_eq!(a.reverse, BTreeMap::from([(0, 0), (1, 1)]));
    }

    #[test]
    fn equal_costs_pair_lower_indices_together() {
        let mut graph = BipartiteGraph::new(3, 3);
        for t in 0..3 {
            for m in 0..3 {
                graph.add_edge(t, m, 0.5);
            }
        }
        let a = assign(&graph);
        assert_eq!(a.direct, BTreeMap::from([(0, 0), (1, 1), (2, 2)]));
    }

    #[test]
    fn non_finite_costs_are_ignored() {
        let mut graph = BipartiteGraph::new(2, 2);
        graph.add_edge(0, 0, f64::NAN);
        graph.add_edge(0, 1, f64::INFINITY);
        graph.add_edge(1, 1, 1.0);
        let a = assign(&graph);
        assert_eq!(a.direct, BTreeMap::from([(1, 1)]));
    }

    #[test]
    fn infeasible_pairs_are_never_matched() {
        // track 1 can only see object 0, which track 0 takes more cheaply
        let mut graph = BipartiteGraph::new(2, 2);
        graph.add_edge(0, 0, 0.1);
        graph.add_edge(1, 0, 0.9);
        let a = assign(&graph);
        assert_eq!(a.direct, BTreeMap::from([(0, 0)]));
        assert!(!a.reverse.contains_key(&1));
    }

    #[test]
    fn feasible_match_beats_leaving_both_unmatched() {
        // the expensive edge is still better than two dummies
        let mut graph = BipartiteGraph::new(2, 2);
        graph.add_edge(0, 0, 0.1);
        graph.add_edge(1, 0, 0.2);
        graph.add_edge(1, 1, 1.4);
        let a = assign(&graph);
        assert_eq!(a.direct, BTreeMap::from([(0, 0), (1, 1)]));
    }

    #[test]
    fn assignment_is_injective() {
        let mut graph = BipartiteGraph::new(4, 3);
        for t in 0..4 {
            for m in 0..3 {
                graph.add_edge(t, m, ((t * 7 + m * 3) % 5) as f64 * 0.1);
            }
        }
        let a = assign(&graph);
        assert_eq!(a.len(), 3);
        for (t, m) in &a.direct {
            assert_eq!(a.reverse[m], *t);
        }
    }

    #[test]
    fn empty_graph_gives_empty_assignment() {
        let a = assign(&BipartiteGraph::new(3, 0));
        assert!(a.is_empty());
    }
}
