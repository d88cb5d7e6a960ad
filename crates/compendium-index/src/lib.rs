//! Indexer façade (component H).
//!
//! A thin, total view layer over `compendium_graph::Index`, grouped the way
//! `turborepo-lib::query::Query`/`Package` group a package graph into
//! accessor views — `Query` hands back a `Package` view per lookup, this
//! hands back a `QueryView`/`FacetedView`/`NeighborhoodView` per grouping.
//! No GraphQL schema here: the façade is consumed directly by Rust callers,
//! not served over a wire protocol, so the view structs are plain methods.

use std::collections::{BTreeSet, HashMap, VecDeque};

use compendium_graph::{GraphError, Index, TopoMode};
use compendium_types::{Compendium, Status};

/// Direction `neighborhood.query` walks from a matched vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborhoodMode {
    /// Ancestors: vertices the matched one depends on.
    In,
    /// Descendants: vertices that depend on the matched one.
    Out,
    /// Union of ancestors and descendants.
    All,
}

/// Owns the graph index and hands out read views plus the two mutating
/// entry points (`index`, `deindex`).
pub struct Indexer {
    index: Index,
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer {
    pub fn new() -> Self {
        Self { index: Index::new() }
    }

    pub fn from_index(index: Index) -> Self {
        Self { index }
    }

    pub fn into_index(self) -> Index {
        self.index
    }

    pub fn index_ref(&self) -> &Index {
        &self.index
    }

    pub fn query(&self) -> QueryView<'_> {
        QueryView(&self.index)
    }

    pub fn faceted(&self) -> FacetedView<'_> {
        FacetedView(&self.index)
    }

    pub fn neighborhood(&self) -> NeighborhoodView<'_> {
        NeighborhoodView(&self.index)
    }

    /// `index(compendium)`: routes to add/update via
    /// `compendium_graph::Index::add`'s own dispatch-on-command_digest.
    pub fn index(&mut self, compendium: Compendium) -> Result<&Compendium, GraphError> {
        let name = compendium.name.clone();
        self.index.add(compendium)?;
        Ok(self.index.get(&name).expect("just indexed"))
    }

    /// `deindex(name, include_descendants)`.
    pub fn deindex(
        &mut self,
        name: &str,
        include_descendants: bool,
    ) -> Result<Vec<String>, GraphError> {
        self.index.delete(name, include_descendants)
    }
}

/// `query.find(predicate)`.
pub struct QueryView<'a>(&'a Index);

impl<'a> QueryView<'a> {
    pub fn find(
        &self,
        predicate: impl Fn(&Compendium) -> bool,
    ) -> impl Iterator<Item = (&'a Compendium, Status)> {
        self.0
            .search(predicate)
            .into_iter()
            .map(|c| (c, c.status))
    }
}

/// `faceted.outdated()`.
pub struct FacetedView<'a>(&'a Index);

impl<'a> FacetedView<'a> {
    pub fn outdated(&self) -> impl Iterator<Item = &'a Compendium> {
        self.0
            .topo_order(TopoMode::Out)
            .into_iter()
            .filter(|c| c.status == Status::Outdated)
    }
}

/// `neighborhood.query(mode, predicate)`.
pub struct NeighborhoodView<'a>(&'a Index);

impl<'a> NeighborhoodView<'a> {
    pub fn query(
        &self,
        mode: NeighborhoodMode,
        predicate: impl Fn(&Compendium) -> bool,
    ) -> Vec<(&'a Compendium, Vec<&'a Compendium>, Status)> {
        let edges = self.0.edges();
        let mut out_adj: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for (u, v) in &edges {
            out_adj.entry(u.as_str()).or_default().push(v.as_str());
            in_adj.entry(v.as_str()).or_default().push(u.as_str());
        }

        self.0
            .search(predicate)
            .into_iter()
            .map(|c| {
                let names = match mode {
                    NeighborhoodMode::Out => bfs(&out_adj, &c.name),
                    NeighborhoodMode::In => bfs(&in_adj, &c.name),
                    NeighborhoodMode::All => {
                        let mut names = bfs(&out_adj, &c.name);
                        names.extend(bfs(&in_adj, &c.name));
                        names
                    }
                };
                let neighborhood: Vec<&Compendium> =
                    names.iter().filter_map(|n| self.0.get(n)).collect();
                (c, neighborhood, c.status)
            })
            .collect()
    }
}

fn bfs(adjacency: &HashMap<&str, Vec<&str>>, start: &str) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.to_string());
    queue.push_back(start.to_string());
    while let Some(current) = queue.pop_front() {
        if let Some(neighbors) = adjacency.get(current.as_str()) {
            for next in neighbors {
                if visited.insert(next.to_string()) {
                    queue.push_back(next.to_string());
                }
            }
        }
    }
    visited.remove(start);
    visited
}

#[cfg(test)]
mod test {
    use compendium_types::{Algorithm, BundleRef, CommandConfig, Digest, FileRef, Timestamp};
    use pretty_assertions::assert_eq;

    use super::*;

    fn digest(seed: &str) -> Digest {
        Digest::new(Algorithm::Sha256, seed.as_bytes())
    }

    fn compendium(name: &str, inputs: &[&str], outputs: &[&str]) -> Compendium {
        Compendium {
            name: name.to_string(),
            command: vec![name.to_string()],
            command_digest: digest(name),
            bundle: BundleRef {
                path: format!("/bundles/{name}").into(),
                digest: digest(name),
                algorithm: Algorithm::Sha256,
            },
            inputs: inputs.iter().map(|d| FileRef::new(format!("/{d}"), digest(d))).collect(),
            outputs: outputs.iter().map(|d| FileRef::new(format!("/{d}"), digest(d))).collect(),
            external_inputs_required: BTreeSet::new(),
            unpacked_files: vec![],
            unpacked_environment_variables: vec![],
            status: Status::Updated,
            updated_at: Timestamp(0),
            command_config: CommandConfig::default(),
        }
    }

    fn pipeline() -> Indexer {
        let mut indexer = Indexer::new();
        indexer.index(compendium("fetch", &[], &["a"])).unwrap();
        indexer.index(compendium("transform", &["a"], &["b"])).unwrap();
        indexer.index(compendium("report", &["b"], &["c"])).unwrap();
        indexer
    }

    #[test]
    fn query_find_matches_by_name() {
        let indexer = pipeline();
        let found: Vec<_> = indexer.query().find(|c| c.name == "transform").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.name, "transform");
        assert_eq!(found[0].1, Status::Updated);
    }

    #[test]
    fn faceted_outdated_is_empty_on_a_fresh_index() {
        let indexer = pipeline();
        assert_eq!(indexer.faceted().outdated().count(), 0);
    }

    #[test]
    fn faceted_outdated_follows_topological_order_after_an_update() {
        let mut indexer = pipeline();
        // Re-indexing the same command (same name, same command_digest)
        // with a new bundle routes to `Index::update`, which bumps the
        // vertex's timestamp and propagates OUTDATED to its descendants.
        let mut refreshed = compendium("fetch", &[], &["a"]);
        refreshed.bundle = BundleRef {
            path: "/bundles/fetch2".into(),
            digest: digest("fetch2"),
            algorithm: Algorithm::Sha256,
        };
        indexer.index(refreshed).unwrap();

        let names: Vec<_> = indexer.faceted().outdated().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["transform".to_string(), "report".to_string()]);
    }

    #[test]
    fn neighborhood_out_reaches_downstream_consumers() {
        let indexer = pipeline();
        let results = indexer
            .neighborhood()
            .query(NeighborhoodMode::Out, |c| c.name == "fetch");
        assert_eq!(results.len(), 1);
        let mut names: Vec<_> = results[0].1.iter().map(|c| c.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["report", "transform"]);
    }

    #[test]
    fn neighborhood_in_reaches_upstream_producers() {
        let indexer = pipeline();
        let results = indexer
            .neighborhood()
            .query(NeighborhoodMode::In, |c| c.name == "report");
        let mut names: Vec<_> = results[0].1.iter().map(|c| c.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["fetch", "transform"]);
    }

    #[test]
    fn deindex_without_descendants_keeps_downstream_vertices() {
        let mut indexer = pipeline();
        let removed = indexer.deindex("fetch", false).unwrap();
        assert_eq!(removed, vec!["fetch".to_string()]);
        assert!(indexer.index_ref().get("transform").is_some());
    }
}
