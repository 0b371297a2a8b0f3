use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use calcnode_core::{
    join_node_ids, CalculationJob, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification,
};

use super::standard::FlatJob;

struct GraphNode {
    job: Option<CalculationJob>,
    specification: CalculationJobSpecification,
    item_count: usize,
    parents: BTreeSet<i64>,
    pending_parents: usize,
    children: Vec<usize>,
    result: Option<CalculationJobResult>,
}

struct GraphState {
    nodes: Vec<GraphNode>,
    completed: usize,
    delivered: bool,
    cancelled: bool,
}

/// Completion tracking for the jobs of one submitted job's tail graph.
///
/// Nodes are held in pre-order. A node becomes ready once all of its parents
/// have a result. When the last node completes the results are merged in
/// node order into one result for the root.
pub struct JobGraph {
    root: CalculationJobSpecification,
    cyclic: Vec<i64>,
    state: Mutex<GraphState>,
}

/// A job whose parents have all completed.
#[derive(Debug)]
pub struct ReadyJob {
    pub node: usize,
    pub job: CalculationJob,
}

impl JobGraph {
    /// Build the graph. Jobs caught in a dependency cycle are recorded and
    /// nothing is handed out; see [`cyclic_jobs`](Self::cyclic_jobs).
    pub fn new(root: CalculationJobSpecification, flat: Vec<FlatJob>) -> Self {
        let index: HashMap<i64, usize> = flat
            .iter()
            .enumerate()
            .map(|(i, f)| (f.job.specification.job_id, i))
            .collect();

        let mut nodes: Vec<GraphNode> = flat
            .into_iter()
            .map(|f| GraphNode {
                item_count: f.job.items().len(),
                specification: f.job.specification.clone(),
                job: Some(f.job),
                parents: f.parents,
                pending_parents: 0,
                children: Vec::new(),
                result: None,
            })
            .collect();
        for i in 0..nodes.len() {
            let parents: Vec<usize> = nodes[i]
                .parents
                .iter()
                .filter_map(|p| index.get(p).copied())
                .collect();
            for p in parents {
                nodes[p].children.push(i);
                nodes[i].pending_parents += 1;
            }
        }

        let cyclic = find_cycle(&nodes)
            .into_iter()
            .map(|i| nodes[i].specification.job_id)
            .collect();
        Self {
            root,
            cyclic,
            state: Mutex::new(GraphState {
                nodes,
                completed: 0,
                delivered: false,
                cancelled: false,
            }),
        }
    }

    /// Ids of jobs whose parents can never all complete.
    pub fn cyclic_jobs(&self) -> &[i64] {
        &self.cyclic
    }

    /// A result failing every item of every job, for a graph that cannot run.
    pub fn failure_result(&self, compute_node_id: &str, message: &str) -> CalculationJobResult {
        let state = self.lock();
        let items = state
            .nodes
            .iter()
            .flat_map(|n| (0..n.item_count).map(move |_| CalculationJobResultItem::job_failure(message)))
            .collect();
        CalculationJobResult::new(self.root.clone(), 0, items, compute_node_id)
    }

    pub fn root(&self) -> &CalculationJobSpecification {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs without parents. Each is handed out once.
    pub fn take_initial(&self) -> Vec<ReadyJob> {
        if !self.cyclic.is_empty() {
            return Vec::new();
        }
        let mut state = self.lock();
        let ready: Vec<usize> = (0..state.nodes.len())
            .filter(|&i| state.nodes[i].pending_parents == 0)
            .collect();
        take_jobs(&mut state, ready)
    }

    /// Record the result of a node. Returns the jobs that became ready, and
    /// the merged root result once every node has completed.
    pub fn complete(
        &self,
        node: usize,
        result: CalculationJobResult,
    ) -> (Vec<ReadyJob>, Option<CalculationJobResult>) {
        let mut state = self.lock();
        if state.cancelled || state.nodes[node].result.is_some() {
            return (Vec::new(), None);
        }
        state.nodes[node].result = Some(result);
        state.completed += 1;

        let mut ready = Vec::new();
        let children = state.nodes[node].children.clone();
        for child in children {
            let c = &mut state.nodes[child];
            c.pending_parents = c.pending_parents.saturating_sub(1);
            if c.pending_parents == 0 {
                ready.push(child);
            }
        }
        let ready = take_jobs(&mut state, ready);

        if state.completed < state.nodes.len() {
            return (ready, None);
        }
        let merged = merge(&self.root, &state.nodes);
        debug!(job_id = %self.root, jobs = state.nodes.len(), "tail graph complete");
        (ready, Some(merged))
    }

    /// Mark the graph delivered. `false` when it was cancelled or already
    /// delivered, in which case the result must be dropped.
    pub fn begin_delivery(&self) -> bool {
        let mut state = self.lock();
        if state.delivered || state.cancelled {
            return false;
        }
        state.delivered = true;
        true
    }

    /// Stop the graph. `false` if it already finished or was cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.delivered || state.cancelled {
            return false;
        }
        state.cancelled = true;
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_done(&self) -> bool {
        let state = self.lock();
        state.delivered || state.cancelled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_jobs(state: &mut GraphState, nodes: Vec<usize>) -> Vec<ReadyJob> {
    nodes
        .into_iter()
        .filter_map(|node| {
            let job = state.nodes[node].job.take()?;
            Some(ReadyJob { node, job })
        })
        .collect()
}

fn merge(root: &CalculationJobSpecification, nodes: &[GraphNode]) -> CalculationJobResult {
    let results: Vec<&CalculationJobResult> = nodes.iter().filter_map(|n| n.result.as_ref()).collect();
    let duration = results.iter().map(|r| r.duration_nanos).sum();
    let items = results.iter().flat_map(|r| r.items.iter().cloned()).collect();
    let node_ids = join_node_ids(results.iter().map(|r| r.compute_node_id.as_str()));
    CalculationJobResult::new(root.clone(), duration, items, node_ids)
}

/// Kahn's algorithm. Returns the nodes left with unresolved parents.
fn find_cycle(nodes: &[GraphNode]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.pending_parents).collect();
    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &child in &nodes[i].children {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }
    if visited == nodes.len() {
        return Vec::new();
    }
    let cyclic: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] > 0).collect();
    warn!(jobs = cyclic.len(), "tail jobs form a dependency cycle");
    cyclic
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcnode_core::{CacheSelectHint, CalculationJobItem, ComputationTargetSpecification, CycleId};

    use crate::config::DEFAULT_JOB_FAILURE_NODE_ID;

    fn flat(cycle: CycleId, id: i64, parents: &[i64]) -> FlatJob {
        let item = CalculationJobItem::new(
            format!("F{id}"),
            ComputationTargetSpecification::new("TRADE", "T1"),
            Vec::new(),
            Vec::new(),
        );
        FlatJob {
            job: CalculationJob::new(
                CalculationJobSpecification::new(cycle, "Default", chrono::Utc::now(), id),
                1,
                None,
                vec![item],
                CacheSelectHint::AllShared,
            ),
            parents: parents.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn result(job: &CalculationJob, node: &str) -> CalculationJobResult {
        CalculationJobResult::new(
            job.specification.clone(),
            10,
            vec![CalculationJobResultItem::success()],
            node,
        )
    }

    #[test]
    fn tail_waits_for_all_parents() {
        let cycle = CycleId::new();
        let jobs = vec![flat(cycle, 1, &[]), flat(cycle, 2, &[1]), flat(cycle, 3, &[1, 2])];
        let graph = JobGraph::new(jobs[0].job.specification.clone(), jobs);
        assert!(graph.cyclic_jobs().is_empty());

        let initial = graph.take_initial();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].node, 0);
        assert!(graph.take_initial().is_empty());

        let (ready, merged) = graph.complete(0, result(&initial[0].job, "n1"));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node, 1);
        assert!(merged.is_none());

        let (ready2, _) = graph.complete(1, result(&ready[0].job, "n2"));
        assert_eq!(ready2.len(), 1);
        assert_eq!(ready2[0].node, 2);

        let (_, merged) = graph.complete(2, result(&ready2[0].job, "n1"));
        let merged = merged.unwrap();
        assert_eq!(merged.specification.job_id, 1);
        assert_eq!(merged.items.len(), 3);
        assert_eq!(merged.duration_nanos, 30);
        assert_eq!(merged.compute_node_id, "n1,n2");
        assert!(graph.begin_delivery());
        assert!(!graph.begin_delivery());
        assert!(!graph.cancel());
    }

    #[test]
    fn cycle_detected() {
        let cycle = CycleId::new();
        let jobs = vec![flat(cycle, 1, &[]), flat(cycle, 2, &[1, 3]), flat(cycle, 3, &[2])];
        let graph = JobGraph::new(jobs[0].job.specification.clone(), jobs);
        assert_eq!(graph.cyclic_jobs(), [2, 3]);
        assert!(graph.take_initial().is_empty());

        let failure = graph.failure_result(DEFAULT_JOB_FAILURE_NODE_ID, "cycle");
        assert_eq!(failure.items.len(), 3);
        assert_eq!(failure.compute_node_id, DEFAULT_JOB_FAILURE_NODE_ID);
    }

    #[test]
    fn cancelled_graph_ignores_results() {
        let cycle = CycleId::new();
        let jobs = vec![flat(cycle, 1, &[])];
        let graph = JobGraph::new(jobs[0].job.specification.clone(), jobs);
        let initial = graph.take_initial();
        assert!(graph.cancel());
        assert!(graph.is_done());
        let (ready, merged) = graph.complete(0, result(&initial[0].job, "n1"));
        assert!(ready.is_empty());
        assert!(merged.is_none());
        assert!(!graph.begin_delivery());
    }
}
