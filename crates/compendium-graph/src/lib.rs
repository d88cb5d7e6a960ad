//! The content-addressed pipeline graph index (component D).
//!
//! Vertices are [`Compendium`] records; an edge `u -> v` exists whenever
//! `outputs(u)` and `inputs(v)` share a digest. The index owns a logical
//! clock used to order updates and to drive staleness propagation.
//!
//! Unlike `turborepo-lib::engine::Engine<S>`'s typestate `Building`/`Built`
//! pair, this graph carries no typestate: it is long-lived and mutated
//! repeatedly over the lifetime of a project, not built once and sealed for
//! a single run. We use `petgraph::stable_graph::StableDiGraph` rather than
//! plain `Graph` for the same reason — node indices must survive arbitrary
//! deletions, not just the one bulk removal turborepo's task graph sees.

pub mod dot;

use std::collections::{BTreeSet, HashMap, VecDeque};

use compendium_types::{Compendium, Digest, Status, Timestamp};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("adding this vertex would create a cycle")]
    CycleDetected,
    #[error("a different vertex already uses the name {name:?}")]
    DuplicateName { name: String },
    #[error("no vertex named {name:?} in the index")]
    UnknownVertex { name: String },
}

impl compendium_types::Classify for GraphError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        compendium_types::ErrorClassification::GraphInvariant
    }
}

/// Direction used by [`Index::topo_order`]: `Out` walks dependencies before
/// dependents (build order); `In` walks dependents before dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoMode {
    Out,
    In,
}

/// Fields an [`Index::update`] call may change. `None` means "leave as is".
/// If every field is `None` the call is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub bundle: Option<compendium_types::BundleRef>,
    pub inputs: Option<Vec<compendium_types::FileRef>>,
    pub outputs: Option<Vec<compendium_types::FileRef>>,
    pub unpacked_files: Option<Vec<camino::Utf8PathBuf>>,
    pub unpacked_environment_variables: Option<Vec<String>>,
    pub command_config: Option<compendium_types::CommandConfig>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.bundle.is_none()
            && self.inputs.is_none()
            && self.outputs.is_none()
            && self.unpacked_files.is_none()
            && self.unpacked_environment_variables.is_none()
            && self.command_config.is_none()
    }
}

struct Node {
    compendium: Compendium,
    insertion_order: u64,
}

/// The logical clock used for `updated_at`. The index is the sole owner;
/// nothing outside this crate may mint a `Timestamp`.
#[derive(Debug, Default)]
struct Clock(u64);

impl Clock {
    fn tick(&mut self) -> Timestamp {
        self.0 += 1;
        Timestamp(self.0)
    }
}

#[derive(Default)]
pub struct Index {
    graph: StableDiGraph<Node, ()>,
    by_name: HashMap<String, NodeIndex>,
    by_command_digest: HashMap<Digest, NodeIndex>,
    clock: Clock,
    insertion_counter: u64,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Compendium> {
        let idx = *self.by_name.get(name)?;
        self.graph.node_weight(idx).map(|n| &n.compendium)
    }

    pub fn get_by_command_digest(&self, digest: &Digest) -> Option<&Compendium> {
        let idx = *self.by_command_digest.get(digest)?;
        self.graph.node_weight(idx).map(|n| &n.compendium)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn next_insertion_order(&mut self) -> u64 {
        self.insertion_counter += 1;
        self.insertion_counter
    }

    /// `add(compendium)`: dispatch to `update` if a vertex with the same
    /// `command_digest` already exists; otherwise insert, wire edges, stamp
    /// the vertex UPDATED at a fresh `updated_at`, then propagate staleness
    /// to strict descendants.
    #[tracing::instrument(skip(self, compendium), fields(name = %compendium.name))]
    pub fn add(&mut self, compendium: Compendium) -> Result<(), GraphError> {
        if self.by_command_digest.contains_key(&compendium.command_digest) {
            return self.update(
                &compendium.command_digest,
                Changes {
                    bundle: Some(compendium.bundle),
                    inputs: Some(compendium.inputs),
                    outputs: Some(compendium.outputs),
                    unpacked_files: Some(compendium.unpacked_files),
                    unpacked_environment_variables: Some(compendium.unpacked_environment_variables),
                    command_config: Some(compendium.command_config),
                },
            );
        }

        if let Some(&existing) = self.by_name.get(&compendium.name) {
            if self.graph[existing].compendium.command_digest != compendium.command_digest {
                return Err(GraphError::DuplicateName {
                    name: compendium.name,
                });
            }
        }

        let name = compendium.name.clone();
        let command_digest = compendium.command_digest.clone();
        let insertion_order = self.next_insertion_order();
        let node = self.graph.add_node(Node {
            compendium,
            insertion_order,
        });
        self.by_name.insert(name, node);
        self.by_command_digest.insert(command_digest, node);

        self.rebuild_edges();

        if self.creates_cycle() {
            self.remove_node(node);
            self.rebuild_edges();
            return Err(GraphError::CycleDetected);
        }

        self.recompute_required_inputs();

        let fresh = self.clock.tick();
        {
            let new_node = &mut self.graph[node];
            new_node.compendium.status = Status::Updated;
            new_node.compendium.updated_at = fresh;
        }
        self.propagate_staleness(node, fresh);

        Ok(())
    }

    /// `update(command_digest, changes)`.
    #[tracing::instrument(skip(self, changes))]
    pub fn update(&mut self, command_digest: &Digest, changes: Changes) -> Result<(), GraphError> {
        let node = *self
            .by_command_digest
            .get(command_digest)
            .ok_or_else(|| GraphError::UnknownVertex {
                name: command_digest.to_string(),
            })?;

        if changes.is_empty() {
            return Ok(());
        }

        {
            let target = &mut self.graph[node].compendium;
            if let Some(bundle) = changes.bundle {
                target.bundle = bundle;
            }
            if let Some(inputs) = changes.inputs {
                target.inputs = inputs;
            }
            if let Some(outputs) = changes.outputs {
                target.outputs = outputs;
            }
            if let Some(unpacked_files) = changes.unpacked_files {
                target.unpacked_files = unpacked_files;
            }
            if let Some(unpacked_environment_variables) = changes.unpacked_environment_variables {
                target.unpacked_environment_variables = unpacked_environment_variables;
            }
            if let Some(command_config) = changes.command_config {
                target.command_config = command_config;
            }
        }

        self.rebuild_edges();
        self.recompute_required_inputs();

        let fresh = self.clock.tick();
        {
            let target = &mut self.graph[node].compendium;
            target.status = Status::Updated;
            target.updated_at = fresh;
        }
        self.propagate_staleness(node, fresh);

        Ok(())
    }

    /// `delete(name, include_descendants)`. Returns the names actually
    /// removed.
    #[tracing::instrument(skip(self))]
    pub fn delete(&mut self, name: &str, include_descendants: bool) -> Result<Vec<String>, GraphError> {
        let start = *self
            .by_name
            .get(name)
            .ok_or_else(|| GraphError::UnknownVertex {
                name: name.to_string(),
            })?;

        let to_remove = if include_descendants {
            self.forward_reachable(start)
        } else {
            let mut set = BTreeSet::new();
            set.insert(start);
            set
        };

        let mut removed_names = Vec::new();
        for idx in &to_remove {
            removed_names.push(self.graph[*idx].compendium.name.clone());
        }
        for idx in to_remove {
            self.remove_node(idx);
        }

        self.rebuild_edges();
        self.recompute_required_inputs();

        Ok(removed_names)
    }

    fn remove_node(&mut self, idx: NodeIndex) {
        if let Some(node) = self.graph.remove_node(idx) {
            self.by_name.remove(&node.compendium.name);
            self.by_command_digest.remove(&node.compendium.command_digest);
        }
    }

    fn forward_reachable(&self, start: NodeIndex) -> BTreeSet<NodeIndex> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        visited
    }

    /// `rebuild_edges`: the edge set is completely reconstructed on every
    /// call, not patched incrementally.
    #[tracing::instrument(skip(self))]
    pub fn rebuild_edges(&mut self) {
        let edges: Vec<_> = self.graph.edge_indices().collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }

        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for &u in &indices {
            let outputs = self.graph[u].compendium.output_digests();
            if outputs.is_empty() {
                continue;
            }
            for &v in &indices {
                if u == v {
                    continue;
                }
                let inputs = self.graph[v].compendium.input_digests();
                if !outputs.is_disjoint(&inputs) {
                    self.graph.add_edge(u, v, ());
                }
            }
        }
    }

    /// `recompute_required_inputs`: for every vertex,
    /// `external_inputs_required = inputs \ union(outputs of in-neighbors)`.
    #[tracing::instrument(skip(self))]
    pub fn recompute_required_inputs(&mut self) {
        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for &v in &indices {
            let mut produced = BTreeSet::new();
            for u in self.graph.neighbors_directed(v, Direction::Incoming) {
                produced.extend(self.graph[u].compendium.output_digests());
            }
            let node = &mut self.graph[v];
            let required: BTreeSet<Digest> = node
                .compendium
                .input_digests()
                .difference(&produced)
                .cloned()
                .collect();
            node.compendium.external_inputs_required = required;
        }
    }

    /// `propagate_staleness(from, t)`: BFS along out-edges; a visited
    /// vertex with `updated_at < t` is set OUTDATED. `from` itself is never
    /// revisited — the caller already brought it to `t`.
    #[tracing::instrument(skip(self))]
    pub fn propagate_staleness(&mut self, from: NodeIndex, t: Timestamp) {
        let mut visited = BTreeSet::new();
        visited.insert(from);
        let mut queue = VecDeque::new();
        queue.push_back(from);
        while let Some(node) = queue.pop_front() {
            let descendants: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            for next in descendants {
                if !visited.insert(next) {
                    continue;
                }
                if self.graph[next].compendium.updated_at < t {
                    self.graph[next].compendium.status = Status::Outdated;
                }
                queue.push_back(next);
            }
        }
    }

    fn creates_cycle(&self) -> bool {
        petgraph::algo::toposort(&self.graph, None).is_err()
    }

    /// `topo_order(mode)`: a topological order, ties broken by insertion
    /// time.
    pub fn topo_order(&self, mode: TopoMode) -> Vec<&Compendium> {
        let direction = match mode {
            TopoMode::Out => Direction::Outgoing,
            TopoMode::In => Direction::Incoming,
        };
        let reverse = match mode {
            TopoMode::Out => Direction::Incoming,
            TopoMode::In => Direction::Outgoing,
        };

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for node in self.graph.node_indices() {
            in_degree.insert(node, self.graph.neighbors_directed(node, reverse).count());
        }

        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&n, _)| n)
            .collect();
        ready.sort_by_key(|n| self.graph[*n].insertion_order);

        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut queue = VecDeque::from(ready);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut newly_ready = Vec::new();
            for next in self.graph.neighbors_directed(node, direction) {
                let deg = in_degree.get_mut(&next).expect("node tracked");
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(next);
                }
            }
            newly_ready.sort_by_key(|n| self.graph[*n].insertion_order);
            for n in newly_ready.into_iter().rev() {
                queue.push_front(n);
            }
            // Re-sort the remainder of the queue so ties are always broken
            // by insertion order rather than discovery order.
            let mut remaining: Vec<_> = queue.drain(..).collect();
            remaining.sort_by_key(|n| self.graph[*n].insertion_order);
            queue = VecDeque::from(remaining);
        }

        order
            .into_iter()
            .map(|idx| &self.graph[idx].compendium)
            .collect()
    }

    /// `search(predicate)`: arbitrary attribute query over indexed vertices.
    pub fn search(&self, predicate: impl Fn(&Compendium) -> bool) -> Vec<&Compendium> {
        self.graph
            .node_weights()
            .map(|n| &n.compendium)
            .filter(|c| predicate(c))
            .collect()
    }

    pub fn all(&self) -> Vec<&Compendium> {
        self.graph.node_weights().map(|n| &n.compendium).collect()
    }

    pub fn outdated(&self) -> Vec<&Compendium> {
        self.search(|c| c.status == compendium_types::Status::Outdated)
    }

    /// All `u -> v` edges by vertex name, for consumers (the execution
    /// planner) that need to restrict the full edge set to a subset of
    /// vertices without borrowing `petgraph` internals directly.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(u, v)| {
                (
                    self.graph[u].compendium.name.clone(),
                    self.graph[v].compendium.name.clone(),
                )
            })
            .collect()
    }

    /// Vertices in insertion order, for consumers (persistence) that need a
    /// deterministic serialization order independent of `StableDiGraph`'s
    /// internal node storage order.
    pub fn ordered_vertices(&self) -> Vec<&Compendium> {
        let mut nodes: Vec<&Node> = self.graph.node_weights().collect();
        nodes.sort_by_key(|n| n.insertion_order);
        nodes.into_iter().map(|n| &n.compendium).collect()
    }

    /// Rebuilds an index from a previously-persisted vertex list, in the
    /// order given (insertion order is preserved exactly, which in turn
    /// preserves `topo_order`'s tie-breaking and `updated_at` ordering).
    /// Edges are never taken as input: per invariant 1 they are fully
    /// determined by the vertex set's input/output digests, so they are
    /// always re-derived via `rebuild_edges` rather than trusted from disk.
    pub fn restore(compendia: Vec<Compendium>) -> Result<Self, GraphError> {
        let mut index = Self::new();
        let mut high_water_mark = 0u64;

        for compendium in compendia {
            if index.by_name.contains_key(&compendium.name) {
                return Err(GraphError::DuplicateName {
                    name: compendium.name,
                });
            }
            high_water_mark = high_water_mark.max(compendium.updated_at.0);

            let name = compendium.name.clone();
            let command_digest = compendium.command_digest.clone();
            let insertion_order = index.next_insertion_order();
            let node = index.graph.add_node(Node {
                compendium,
                insertion_order,
            });
            index.by_name.insert(name, node);
            index.by_command_digest.insert(command_digest, node);
        }

        index.rebuild_edges();
        if index.creates_cycle() {
            return Err(GraphError::CycleDetected);
        }
        index.recompute_required_inputs();
        index.clock = Clock(high_water_mark);

        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet as Set;

    use compendium_types::{
        Algorithm, BundleRef, CommandConfig, Digest, FileRef,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn digest(seed: &str) -> Digest {
        Digest::new(Algorithm::Sha256, seed.as_bytes())
    }

    fn compendium(name: &str, command: &str, inputs: &[&str], outputs: &[&str]) -> Compendium {
        Compendium {
            name: name.to_string(),
            command: vec![command.to_string()],
            command_digest: digest(command),
            bundle: BundleRef {
                path: format!("/bundles/{name}").into(),
                digest: digest(name),
                algorithm: Algorithm::Sha256,
            },
            inputs: inputs
                .iter()
                .map(|d| FileRef::new(format!("/{d}"), digest(d)))
                .collect(),
            outputs: outputs
                .iter()
                .map(|d| FileRef::new(format!("/{d}"), digest(d)))
                .collect(),
            external_inputs_required: Set::new(),
            unpacked_files: vec![],
            unpacked_environment_variables: vec![],
            status: Status::Updated,
            updated_at: Timestamp(0),
            command_config: CommandConfig::default(),
        }
    }

    #[test]
    fn add_then_rebuild_edges_wires_linear_pipeline() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();

        let order = index.topo_order(TopoMode::Out);
        let names: Vec<_> = order.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["fetch", "transform"]);
    }

    #[test]
    fn recompute_required_inputs_reflects_missing_producer() {
        let mut index = Index::new();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();
        let transform = index.get("transform").unwrap();
        assert!(transform.external_inputs_required.contains(&digest("a")));
    }

    #[test]
    fn adding_producer_later_clears_required_input() {
        let mut index = Index::new();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        let transform = index.get("transform").unwrap();
        assert!(!transform.external_inputs_required.contains(&digest("a")));
    }

    #[test]
    fn update_bumps_timestamp_and_propagates_outdated() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();

        let fetch_digest = index.get("fetch").unwrap().command_digest.clone();
        index
            .update(
                &fetch_digest,
                Changes {
                    bundle: Some(BundleRef {
                        path: "/bundles/fetch2".into(),
                        digest: digest("fetch2"),
                        algorithm: Algorithm::Sha256,
                    }),
                    inputs: None,
                    outputs: None,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(index.get("transform").unwrap().status, Status::Outdated);
    }

    #[test]
    fn update_with_no_changes_is_a_no_op() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        let before = index.get("fetch").unwrap().updated_at;
        let command_digest = index.get("fetch").unwrap().command_digest.clone();
        index.update(&command_digest, Changes::default()).unwrap();
        assert_eq!(index.get("fetch").unwrap().updated_at, before);
    }

    #[test]
    fn add_rejects_cycles() {
        let mut index = Index::new();
        index.add(compendium("a", "a.sh", &["z"], &["x"])).unwrap();
        let err = index.add(compendium("b", "b.sh", &["x"], &["z"]));
        assert!(matches!(err, Err(GraphError::CycleDetected)));
        // The failed insert must not have left a dangling vertex behind.
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_without_descendants_exposes_required_input_gap() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();

        index.delete("fetch", false).unwrap();

        let transform = index.get("transform").unwrap();
        assert!(transform.external_inputs_required.contains(&digest("a")));
        // Deleting a producer does not retroactively mark consumers stale.
        assert_eq!(transform.status, Status::Updated);
    }

    #[test]
    fn delete_with_descendants_removes_the_whole_forward_set() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();

        let removed = index.delete("fetch", true).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(index.get("fetch").is_none());
        assert!(index.get("transform").is_none());
    }

    #[test]
    fn diamond_dependency_both_producers_become_in_neighbors() {
        let mut index = Index::new();
        index.add(compendium("left", "left.sh", &[], &["shared"])).unwrap();
        index.add(compendium("right", "right.sh", &[], &["shared"])).unwrap();
        index.add(compendium("join", "join.sh", &["shared"], &["out"])).unwrap();

        let join = index.get("join").unwrap();
        assert!(join.external_inputs_required.is_empty());
    }

    #[test]
    fn search_finds_outdated_vertices() {
        let mut index = Index::new();
        index.add(compendium("fetch", "fetch.sh", &[], &["a"])).unwrap();
        index.add(compendium("transform", "transform.sh", &["a"], &["b"])).unwrap();
        let fetch_digest = index.get("fetch").unwrap().command_digest.clone();
        index
            .update(
                &fetch_digest,
                Changes {
                    bundle: Some(BundleRef {
                        path: "/bundles/fetch2".into(),
                        digest: digest("fetch2"),
                        algorithm: Algorithm::Sha256,
                    }),
                    inputs: None,
                    outputs: None,
                    ..Default::default()
                },
            )
            .unwrap();

        let outdated = index.outdated();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].name, "transform");
    }
}
