//! Graph executor (component F).
//!
//! Generalizes `turborepo-graph-utils::walker::Walker` from a unit-payload
//! "finished" signal per node to one carrying a `JobResult<P>`: instead of
//! only unblocking dependents, each node forwards its actual result along
//! outgoing edges so the operator can fold predecessor results together.
//! Concurrency is bounded by a `tokio::sync::Semaphore` sized from the
//! `SchedulerMode` rather than a manual running/idle selection tick —
//! `Semaphore` gives the same "at most P in flight" guarantee the original
//! `CustomizableSelector` computed by hand, for free.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{IntoNeighborsDirected, IntoNodeIdentifiers};
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::planner::Job;

/// Outcome of one job, oblivious to what the job actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ok,
    Error,
}

/// A job's result, generic over the operator-defined payload `P` forwarded
/// to dependents (e.g. produced output digests for wiring into a sandbox).
#[derive(Debug, Clone)]
pub struct JobResult<P> {
    pub status: JobStatus,
    pub payload: Option<P>,
}

impl<P> JobResult<P> {
    pub fn ok(payload: P) -> Self {
        Self {
            status: JobStatus::Ok,
            payload: Some(payload),
        }
    }

    pub fn error() -> Self {
        Self {
            status: JobStatus::Error,
            payload: None,
        }
    }
}

/// How many jobs a scheduler admits at once. Grounded on
/// `CustomizableSelector.select(running, idle)` from the original
/// implementation; here `select` just sizes the semaphore instead of being
/// polled every tick, since Tokio's own task scheduler already does the
/// per-tick bookkeeping the original did manually.
pub trait Selector {
    fn bound(&self) -> usize;
}

pub struct BoundedSelector(pub usize);

impl Selector for BoundedSelector {
    fn bound(&self) -> usize {
        self.0.max(1)
    }
}

impl From<compendium_types::SchedulerMode> for BoundedSelector {
    fn from(mode: compendium_types::SchedulerMode) -> Self {
        match mode {
            compendium_types::SchedulerMode::Sequential => BoundedSelector(1),
            compendium_types::SchedulerMode::Parallel { bound } => BoundedSelector(bound as usize),
        }
    }
}

type WalkMessage<P> = (NodeIndex, Vec<JobResult<P>>, oneshot::Sender<JobResult<P>>);

pub struct Executor<P> {
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<P>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

impl<P: Clone + Send + 'static> Executor<P> {
    /// Build an executor for `plan`. The plan must not be mutated after
    /// this call — emitted node indices are captured at construction time.
    pub fn new<S: Selector>(
        plan: &petgraph::stable_graph::StableDiGraph<Job, ()>,
        selector: &S,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(selector.bound()));

        let mut txs = HashMap::new();
        let mut rxs = HashMap::new();
        for node in plan.node_identifiers() {
            let (tx, rx) = broadcast::channel::<JobResult<P>>(1);
            txs.insert(node, tx);
            rxs.insert(node, rx);
        }

        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(txs.len(), 1));
        let join_handles = FuturesUnordered::new();

        for node in plan.node_identifiers() {
            let tx = txs.remove(&node).expect("sender for every node");
            let mut cancel_rx = cancel_rx.clone();
            let node_tx = node_tx.clone();
            let permits = permits.clone();
            let mut deps_rx: Vec<_> = plan
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| {
                    rxs.get(&dep)
                        .expect("graph should have all nodes")
                        .resubscribe()
                })
                .collect();

            join_handles.push(tokio::spawn(async move {
                let deps_fut = join_all(deps_rx.iter_mut().map(|rx| rx.recv()));

                let predecessor_results = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => return,
                    results = deps_fut => {
                        let mut collected = Vec::with_capacity(results.len());
                        for res in results {
                            match res {
                                Ok(result) => collected.push(result),
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(_)) => {
                                    tracing::trace!("predecessor result observed more than once");
                                }
                            }
                        }
                        collected
                    }
                };

                let permit = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                };

                let (callback_tx, callback_rx) = oneshot::channel();
                if node_tx
                    .send((node, predecessor_results, callback_tx))
                    .await
                    .is_err()
                {
                    return;
                }

                let result = match callback_rx.await {
                    Ok(result) => result,
                    Err(_) => JobResult::error(),
                };
                drop(permit);

                // Send errors mean no receivers (no dependents); expected
                // for sink nodes.
                tx.send(result).ok();
            }));
        }

        Self {
            cancel,
            node_events: Some(node_rx),
            join_handles,
        }
    }

    /// Begin executing, returning a channel of `(job index, predecessor
    /// results, completion callback)` the caller drives the operator from.
    pub fn run(self) -> (RunningExecutor, mpsc::Receiver<WalkMessage<P>>) {
        let Self {
            cancel,
            mut node_events,
            join_handles,
        } = self;
        let node_events = node_events.take().expect("executor used only once");
        (
            RunningExecutor {
                cancel,
                join_handles,
            },
            node_events,
        )
    }
}

pub struct RunningExecutor {
    cancel: watch::Sender<bool>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

impl RunningExecutor {
    /// Abort all not-yet-started jobs at their next tick. Running jobs
    /// finish.
    pub fn cancel(&self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use compendium_types::SchedulerMode;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn runs_in_topological_order_and_forwards_payloads() {
        let mut plan = petgraph::stable_graph::StableDiGraph::<Job, ()>::new();
        let a = plan.add_node(Job::Command {
            argv: vec!["a".to_string()],
        });
        let b = plan.add_node(Job::Command {
            argv: vec!["b".to_string()],
        });
        let c = plan.add_node(Job::Command {
            argv: vec!["c".to_string()],
        });
        plan.add_edge(a, b, ());
        plan.add_edge(b, c, ());

        let selector = BoundedSelector::from(SchedulerMode::Sequential);
        let executor = Executor::<u32>::new(&plan, &selector);
        let (running, mut events) = executor.run();

        let mut order = Vec::new();
        while let Some((node, preds, callback)) = events.recv().await {
            order.push(node);
            let sum: u32 = preds.iter().filter_map(|r| r.payload).sum();
            callback.send(JobResult::ok(sum + 1)).unwrap();
        }
        running.wait().await.unwrap();

        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test]
    async fn downstream_jobs_still_run_after_a_predecessor_errors() {
        let mut plan = petgraph::stable_graph::StableDiGraph::<Job, ()>::new();
        let a = plan.add_node(Job::Command {
            argv: vec!["a".to_string()],
        });
        let b = plan.add_node(Job::Command {
            argv: vec!["b".to_string()],
        });
        plan.add_edge(a, b, ());

        let selector = BoundedSelector::from(SchedulerMode::Sequential);
        let executor = Executor::<u32>::new(&plan, &selector);
        let (running, mut events) = executor.run();

        let mut statuses = Vec::new();
        while let Some((node, preds, callback)) = events.recv().await {
            if node == a {
                callback.send(JobResult::error()).unwrap();
            } else {
                statuses.push(preds.first().map(|r| r.status));
                callback.send(JobResult::ok(1u32)).unwrap();
            }
        }
        running.wait().await.unwrap();

        assert_eq!(statuses, vec![Some(JobStatus::Error)]);
    }

    #[tokio::test]
    async fn three_wide_fanout_starts_concurrently_under_a_bound_of_three() {
        let mut plan = petgraph::stable_graph::StableDiGraph::<Job, ()>::new();
        let a = plan.add_node(Job::Command {
            argv: vec!["a".to_string()],
        });
        let b = plan.add_node(Job::Command {
            argv: vec!["b".to_string()],
        });
        let c = plan.add_node(Job::Command {
            argv: vec!["c".to_string()],
        });
        let d = plan.add_node(Job::Command {
            argv: vec!["d".to_string()],
        });
        plan.add_edge(a, b, ());
        plan.add_edge(a, c, ());
        plan.add_edge(a, d, ());

        let selector = BoundedSelector::from(SchedulerMode::Parallel { bound: 3 });
        let executor = Executor::<u32>::new(&plan, &selector);
        let (running, mut events) = executor.run();

        let (a_node, _, a_callback) = events.recv().await.unwrap();
        assert_eq!(a_node, a);
        a_callback.send(JobResult::ok(1)).unwrap();

        // With three free permits, B/C/D don't wait on each other: all three
        // reach the channel before any of them is answered.
        let mut fanout = Vec::new();
        let mut callbacks = Vec::new();
        for _ in 0..3 {
            let (node, _, callback) = events.recv().await.unwrap();
            fanout.push(node);
            callbacks.push(callback);
        }
        fanout.sort();
        let mut expected = vec![b, c, d];
        expected.sort();
        assert_eq!(fanout, expected);

        for callback in callbacks {
            callback.send(JobResult::ok(1)).unwrap();
        }
        running.wait().await.unwrap();
    }
}
