use std::collections::{BTreeSet, HashMap};

use calcnode_core::CalculationJob;

use super::hints::adjust_cache_hints;

/// A job of the tail graph without its tail, plus the jobs it waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatJob {
    pub job: CalculationJob,
    /// Job ids inside the same graph that must complete first.
    pub parents: BTreeSet<i64>,
}

/// A submitted job together with its tail graph.
#[derive(Debug, Clone)]
pub struct StandardJob {
    root: CalculationJob,
}

impl StandardJob {
    pub fn new(root: CalculationJob) -> Self {
        Self { root }
    }

    pub fn job(&self) -> &CalculationJob {
        &self.root
    }

    /// A lone single-item job: when it fails there is nothing to split and
    /// the function gets blacklisted.
    pub fn fails_outright(&self) -> bool {
        !self.root.has_tail() && self.root.items().len() == 1
    }

    /// Every job of the graph in pre-order, each once.
    ///
    /// A job's parents are the jobs listing it as a tail plus the
    /// `required_job_ids` that name a job of this graph. When the graph has
    /// more than one job, cache hints are rewritten so values passed between
    /// jobs are shared.
    pub fn flatten(&self) -> Vec<FlatJob> {
        let mut flat: Vec<FlatJob> = Vec::new();
        let mut index: HashMap<i64, usize> = HashMap::new();
        visit(&self.root, None, &mut flat, &mut index);

        for entry in &mut flat {
            if let Some(required) = entry.job.required_job_ids.as_ref() {
                let own = entry.job.specification.job_id;
                entry.parents.extend(
                    required
                        .iter()
                        .copied()
                        .filter(|id| *id != own && index.contains_key(id)),
                );
            }
        }

        if flat.len() > 1 {
            let mut jobs: Vec<CalculationJob> = flat.iter().map(|f| f.job.clone()).collect();
            adjust_cache_hints(&mut jobs);
            for (entry, job) in flat.iter_mut().zip(jobs) {
                entry.job = job;
            }
        }
        flat
    }
}

fn visit(
    job: &CalculationJob,
    parent: Option<i64>,
    flat: &mut Vec<FlatJob>,
    index: &mut HashMap<i64, usize>,
) {
    let job_id = job.specification.job_id;
    if let Some(&existing) = index.get(&job_id) {
        flat[existing].parents.extend(parent);
        return;
    }
    index.insert(job_id, flat.len());
    flat.push(FlatJob {
        job: job.without_tail(),
        parents: parent.into_iter().collect(),
    });
    for child in job.tail().unwrap_or_default() {
        visit(child, Some(job_id), flat, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcnode_core::{
        CacheSelectHint, CalculationJobItem, CalculationJobSpecification,
        ComputationTargetSpecification, CycleId, ValueSpecification,
    };

    fn vs(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, ComputationTargetSpecification::new("TRADE", "T1"))
    }

    fn job(cycle: CycleId, id: i64, inputs: &[&str], outputs: &[&str], required: Option<Vec<i64>>) -> CalculationJob {
        let item = CalculationJobItem::new(
            format!("F{id}"),
            ComputationTargetSpecification::new("TRADE", "T1"),
            inputs.iter().map(|n| vs(n)),
            outputs.iter().map(|n| vs(n)),
        );
        CalculationJob::new(
            CalculationJobSpecification::new(cycle, "Default", chrono::Utc::now(), id),
            1,
            required,
            vec![item],
            CacheSelectHint::AllPrivate,
        )
    }

    #[test]
    fn single_item_without_tail_fails_outright() {
        let cycle = CycleId::new();
        assert!(StandardJob::new(job(cycle, 1, &[], &["A"], None)).fails_outright());
        let with_tail = job(cycle, 1, &[], &["A"], None).with_tail(vec![job(cycle, 2, &["A"], &["B"], None)]);
        assert!(!StandardJob::new(with_tail).fails_outright());
    }

    #[test]
    fn flatten_is_preorder_with_parents() {
        let cycle = CycleId::new();
        let t2 = job(cycle, 3, &["A", "B"], &["C"], Some(vec![1, 2]));
        let t1 = job(cycle, 2, &["A"], &["B"], Some(vec![1]));
        let root = job(cycle, 1, &[], &["A"], None).with_tail(vec![t1, t2]);

        let flat = StandardJob::new(root).flatten();
        let ids: Vec<i64> = flat.iter().map(|f| f.job.specification.job_id).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert!(flat[0].parents.is_empty());
        assert_eq!(flat[1].parents, BTreeSet::from([1]));
        assert_eq!(flat[2].parents, BTreeSet::from([1, 2]));
        assert!(flat.iter().all(|f| !f.job.has_tail()));
    }

    #[test]
    fn shared_tail_visited_once() {
        let cycle = CycleId::new();
        let shared = job(cycle, 4, &["B", "C"], &["D"], None);
        let t1 = job(cycle, 2, &["A"], &["B"], None).with_tail(vec![shared.clone()]);
        let t2 = job(cycle, 3, &["A"], &["C"], None).with_tail(vec![shared]);
        let root = job(cycle, 1, &[], &["A"], None).with_tail(vec![t1, t2]);

        let flat = StandardJob::new(root).flatten();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[3].job.specification.job_id, 4);
        assert_eq!(flat[3].parents, BTreeSet::from([2, 3]));
    }

    #[test]
    fn values_between_graph_jobs_become_shared() {
        let cycle = CycleId::new();
        let root = job(cycle, 1, &["X"], &["A"], None).with_tail(vec![job(cycle, 2, &["A"], &["B"], None)]);
        let flat = StandardJob::new(root).flatten();
        assert!(!flat[0].job.cache_select_hint.is_private_value(&vs("A")));
        assert!(!flat[1].job.cache_select_hint.is_private_value(&vs("A")));
        assert!(flat[1].job.cache_select_hint.is_private_value(&vs("B")));
        assert!(flat[0].job.cache_select_hint.is_private_value(&vs("X")));
    }

    #[test]
    fn lone_job_hint_untouched() {
        let cycle = CycleId::new();
        let flat = StandardJob::new(job(cycle, 1, &[], &["A"], None)).flatten();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].job.cache_select_hint, CacheSelectHint::AllPrivate);
    }
}
