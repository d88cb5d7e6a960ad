//! Execution planner (component E): turns index state into a plan DAG.

use std::collections::{BTreeSet, HashMap};

use compendium_graph::Index;
use compendium_types::Digest;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("the index has outdated vertices; run plan_rerun before planning new work")]
    IndexOutdated,
}

impl compendium_types::Classify for EngineError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        compendium_types::ErrorClassification::State
    }
}

/// A unit of work in a plan DAG.
#[derive(Debug, Clone)]
pub enum Job {
    /// Wraps a literal command to be traced and built fresh.
    Command { argv: Vec<String> },
    /// Wraps a sealed compendium to be reproduced from its bundle.
    Compendium { name: String, bundle_digest: Digest },
}

impl Job {
    pub fn name(&self) -> Option<&str> {
        match self {
            Job::Command { .. } => None,
            Job::Compendium { name, .. } => Some(name),
        }
    }
}

/// A plan DAG: jobs as vertices, `u -> v` meaning `v` must wait for `u`.
pub type Plan = StableDiGraph<Job, ()>;

fn guard_outdated(index: &Index) -> Result<(), EngineError> {
    if index.outdated().is_empty() {
        Ok(())
    } else {
        Err(EngineError::IndexOutdated)
    }
}

/// One vertex wrapping the literal command. Refuses with `IndexOutdated`
/// if the index has stale vertices.
pub fn plan_run(index: &Index, argv: Vec<String>) -> Result<Plan, EngineError> {
    guard_outdated(index)?;
    let mut plan = Plan::new();
    plan.add_node(Job::Command { argv });
    Ok(plan)
}

/// Selects all OUTDATED vertices, wraps each command in a `CommandJob`,
/// and restricts the index's edge set to this subset. Exempt from the
/// `IndexOutdated` guard — it's the mechanism that clears it. Returns an
/// empty plan if nothing is outdated.
pub fn plan_rerun(index: &Index) -> Plan {
    let outdated = index.outdated();
    let mut plan = Plan::new();
    if outdated.is_empty() {
        return plan;
    }

    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let names: BTreeSet<String> = outdated.iter().map(|c| c.name.clone()).collect();

    for compendium in &outdated {
        let node = plan.add_node(Job::Command {
            argv: compendium.command.clone(),
        });
        nodes.insert(compendium.name.clone(), node);
    }

    for (u, v) in index.edges() {
        if names.contains(&u) && names.contains(&v) {
            plan.add_edge(nodes[&u], nodes[&v], ());
        }
    }

    plan
}

/// Every vertex, wrapped as a `CompendiumJob` carrying its sealed bundle
/// digest, with the full edge set preserved. Never subject to the
/// `IndexOutdated` guard — reproduction replays exactly what was sealed,
/// independent of live staleness.
pub fn plan_reproduce(index: &Index) -> Plan {
    let mut plan = Plan::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

    for compendium in index.all() {
        let node = plan.add_node(Job::Compendium {
            name: compendium.name.clone(),
            bundle_digest: compendium.bundle.digest.clone(),
        });
        nodes.insert(compendium.name.clone(), node);
    }

    for (u, v) in index.edges() {
        if let (Some(&u), Some(&v)) = (nodes.get(&u), nodes.get(&v)) {
            plan.add_edge(u, v, ());
        }
    }

    plan
}
