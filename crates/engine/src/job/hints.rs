use std::collections::{BTreeMap, BTreeSet};

use calcnode_core::{CacheSelectHint, CalculationJob, ValueSpecification};

#[derive(Default)]
struct Usage {
    producers: BTreeSet<usize>,
    consumers: BTreeSet<usize>,
}

/// Rewrite the cache hints of jobs that execute independently of each other
/// but were planned together.
///
/// A value stays private only when every producer marked it private and the
/// value is produced and consumed inside one single job. A value crossing a
/// job boundary becomes shared. Values produced outside `jobs` keep each
/// job's original classification.
pub fn adjust_cache_hints(jobs: &mut [CalculationJob]) {
    let mut usage: BTreeMap<ValueSpecification, Usage> = BTreeMap::new();
    for (index, job) in jobs.iter().enumerate() {
        for item in job.items() {
            for spec in &item.outputs {
                usage.entry(spec.clone()).or_default().producers.insert(index);
            }
            for spec in &item.inputs {
                usage.entry(spec.clone()).or_default().consumers.insert(index);
            }
        }
    }

    let hints: Vec<CacheSelectHint> = jobs
        .iter()
        .enumerate()
        .map(|(index, job)| {
            let mut all = BTreeSet::new();
            let mut private = BTreeSet::new();
            for item in job.items() {
                for spec in item.inputs.iter().chain(item.outputs.iter()) {
                    if !all.insert(spec.clone()) {
                        continue;
                    }
                    if is_private(spec, index, jobs, usage.get(spec)) {
                        private.insert(spec.clone());
                    }
                }
            }
            CacheSelectHint::from_partition(private, &all)
        })
        .collect();

    for (job, hint) in jobs.iter_mut().zip(hints) {
        job.cache_select_hint = hint;
    }
}

fn is_private(
    spec: &ValueSpecification,
    index: usize,
    jobs: &[CalculationJob],
    usage: Option<&Usage>,
) -> bool {
    let Some(usage) = usage.filter(|u| !u.producers.is_empty()) else {
        return jobs[index].cache_select_hint.is_private_value(spec);
    };
    let all_private = usage
        .producers
        .iter()
        .all(|&p| jobs[p].cache_select_hint.is_private_value(spec));
    let single_job = usage
        .producers
        .iter()
        .chain(usage.consumers.iter())
        .all(|&j| j == index);
    all_private && single_job
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcnode_core::{
        CalculationJobItem, CalculationJobSpecification, ComputationTargetSpecification, CycleId,
    };

    fn vs(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, ComputationTargetSpecification::new("TRADE", "T1"))
    }

    fn item(inputs: &[&str], outputs: &[&str]) -> CalculationJobItem {
        CalculationJobItem::new(
            "F",
            ComputationTargetSpecification::new("TRADE", "T1"),
            inputs.iter().map(|n| vs(n)),
            outputs.iter().map(|n| vs(n)),
        )
    }

    fn job(id: i64, items: Vec<CalculationJobItem>, hint: CacheSelectHint) -> CalculationJob {
        CalculationJob::new(
            CalculationJobSpecification::new(CycleId::new(), "Default", chrono::Utc::now(), id),
            1,
            None,
            items,
            hint,
        )
    }

    #[test]
    fn value_crossing_boundary_becomes_shared() {
        let hint = CacheSelectHint::private_values([vs("A")]);
        let mut jobs = vec![
            job(1, vec![item(&[], &["A"])], hint.clone()),
            job(2, vec![item(&["A"], &["B"])], hint),
        ];
        adjust_cache_hints(&mut jobs);
        assert!(!jobs[0].cache_select_hint.is_private_value(&vs("A")));
        assert!(!jobs[1].cache_select_hint.is_private_value(&vs("A")));
    }

    #[test]
    fn value_inside_one_job_stays_private() {
        let hint = CacheSelectHint::private_values([vs("A")]);
        let mut jobs = vec![
            job(1, vec![item(&[], &["A"]), item(&["A"], &["B"])], hint.clone()),
            job(2, vec![item(&["B"], &["C"])], hint),
        ];
        adjust_cache_hints(&mut jobs);
        assert!(jobs[0].cache_select_hint.is_private_value(&vs("A")));
        assert!(!jobs[0].cache_select_hint.is_private_value(&vs("B")));
        assert!(!jobs[1].cache_select_hint.is_private_value(&vs("B")));
    }

    #[test]
    fn shared_value_never_becomes_private() {
        let mut jobs = vec![job(
            1,
            vec![item(&[], &["A"]), item(&["A"], &["B"])],
            CacheSelectHint::AllShared,
        )];
        adjust_cache_hints(&mut jobs);
        assert_eq!(jobs[0].cache_select_hint, CacheSelectHint::AllShared);
    }

    #[test]
    fn external_inputs_keep_original_classification() {
        let mut jobs = vec![job(1, vec![item(&["X"], &["A"])], CacheSelectHint::AllPrivate)];
        adjust_cache_hints(&mut jobs);
        assert!(jobs[0].cache_select_hint.is_private_value(&vs("X")));
        assert!(jobs[0].cache_select_hint.is_private_value(&vs("A")));
    }
}
