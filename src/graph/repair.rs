use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::errors::*;
use crate::graph::*;

/// A setup job in a dependency closure and the persisted job doing the same work.
#[derive(Debug, Clone)]
pub struct SetupMatch {
    pub job: JobId,
    pub prior: PersistedJob,
}

/// Walk the dependency closure of `id`, including `id` itself, and look up
/// the persisted jobs of every setup job that is not a persisted record yet.
/// Each setup job yields all of its matches, oldest record first.
pub fn get_setup_jobs(graph: &JobGraph, id: JobId, db: &dyn JobDatabase) -> Result<Vec<SetupMatch>> {
    let mut res = Vec::new();

    for dep in graph.dependency_closure(id) {
        let job = graph.job(dep)?;
        if !job.kind.is_setup() || job.record.is_some() {
            continue;
        }

        let inputs = job.inputs.values().map(String::as_str).collect::<Vec<_>>();
        let outputs = job.outputs.values().map(String::as_str).collect::<Vec<_>>();
        let mut priors = db
            .query_jobs_by_files(&inputs, &outputs)?
            .into_iter()
            .filter(|p| p.kind == job.kind)
            .collect::<Vec<_>>();
        priors.sort_by_key(|p| p.id);

        res.extend(priors.into_iter().map(|prior| SetupMatch { job: dep, prior }));
    }

    Ok(res)
}

/// Delete `id` and everything that depends on it, children first.
fn remove_failed(db: &mut dyn JobDatabase, id: u64, removed: &mut BTreeSet<u64>) -> Result<()> {
    if !removed.insert(id) {
        return Ok(());
    }
    let Some(job) = db.get(id)? else {
        return Ok(());
    };

    for child in &job.children {
        remove_failed(db, *child, removed)?;
    }

    tracing::info!(job = %job.name, id, state = %job.state, "removing previous job");
    db.delete_job(id, true)?;
    Ok(())
}

/// Drop or rewire jobs of `ids` whose setup work was already submitted.
///
/// For each job, persisted setup jobs matching a setup job in its dependency
/// closure are handled as follows:
/// * a FAILED match is deleted together with its children and ignored;
/// * a match with the job's own name means the job itself is already
///   scheduled, so it is left out of the result;
/// * a match named like one of the job's direct dependencies replaces that
///   dependency, and the job and its children are queued again.
///
/// Returns the jobs of `ids` that still have to be scheduled, in order.
pub fn check_jobs_dependencies(
    graph: &mut JobGraph,
    ids: &[JobId],
    db: &mut dyn JobDatabase,
) -> Result<Vec<JobId>> {
    let mut removed = BTreeSet::new();
    let mut imported = FxHashMap::<u64, JobId>::default();
    let mut res = Vec::with_capacity(ids.len());

    for &id in ids {
        let mut keep = true;

        for SetupMatch { prior, .. } in get_setup_jobs(graph, id, &*db)? {
            if removed.contains(&prior.id) {
                continue;
            }
            if prior.state == JobState::Failed {
                remove_failed(db, prior.id, &mut removed)?;
                continue;
            }

            if prior.name == graph.job(id)?.name {
                tracing::debug!(job = %prior.name, id = prior.id, "job already scheduled");
                keep = false;
                continue;
            }

            let duplicate = graph
                .job(id)?
                .dependencies
                .iter()
                .copied()
                .find(|d| graph.get(*d).map(|j| j.name == prior.name).unwrap_or(false));
            let Some(duplicate) = duplicate else {
                continue;
            };

            let existing = *imported
                .entry(prior.id)
                .or_insert_with(|| graph.add(prior.to_job()));
            if duplicate != existing {
                tracing::debug!(
                    job = %graph.job(id)?.name,
                    dependency = %prior.name,
                    id = prior.id,
                    "reusing previous job"
                );
                graph.remove_edge(duplicate, id);
                graph.add_edge(existing, id)?;
            }
            graph.propagate_state(id, JobState::Queued);
        }

        if keep {
            res.push(id);
        }
    }

    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_graph(genome: &str) -> (JobGraph, JobId, JobId, JobId) {
        let mut g = JobGraph::new();
        let mut index = Job::new("index.genome", "gem_index", ToolKind::Indexer);
        index.inputs = params([("input", genome)]);
        index.outputs = params([("output", "/refs/genome.gem")]);
        let mut gem = Job::new("gem.a", "gem", ToolKind::Aligner);
        gem.inputs = params([("index", "/refs/genome.gem")]);
        gem.outputs = params([("map", "/data/a.map.gz")]);
        let mut flux = Job::new("flux.a", "flux", ToolKind::Quantifier);
        flux.inputs = params([("input", "/data/a.map.gz")]);

        let index = g.add(index);
        let gem = g.add(gem);
        let flux = g.add(flux);
        g.add_edge(index, gem).unwrap();
        g.add_edge(gem, flux).unwrap();
        (g, index, gem, flux)
    }

    #[test]
    fn nothing_persisted_keeps_everything() {
        let (mut g, ..) = setup_graph("/refs/genome.fa");
        let ids = g.ids().collect::<Vec<_>>();
        let mut db = MemoryJobDatabase::new();
        assert_eq!(check_jobs_dependencies(&mut g, &ids, &mut db).unwrap(), ids);
    }

    #[test]
    fn live_setup_job_is_reused() {
        let (mut prev, ..) = setup_graph("/refs/genome.fa");
        let mut db = MemoryJobDatabase::new();
        let prev_ids = prev.ids().collect::<Vec<_>>();
        save_jobs(&mut db, &mut prev, &prev_ids).unwrap();
        let record = prev.job(JobId(0)).unwrap().record.unwrap();

        let (mut g, index, gem, flux) = setup_graph("/refs/genome.fa");
        g.job_mut(gem).unwrap().state = JobState::Done;
        g.job_mut(flux).unwrap().state = JobState::Done;
        let ids = g.ids().collect::<Vec<_>>();

        let kept = check_jobs_dependencies(&mut g, &ids, &mut db).unwrap();
        assert_eq!(kept, vec![gem, flux]);

        let reused = g.job(gem).unwrap().dependencies[0];
        assert_ne!(reused, index);
        assert_eq!(g.job(reused).unwrap().record, Some(record));
        assert!(g.job(index).unwrap().children.is_empty());
        assert_eq!(g.job(gem).unwrap().state, JobState::Queued);
        assert_eq!(g.job(flux).unwrap().state, JobState::Queued);
    }

    #[test]
    fn failed_setup_job_is_replaced() {
        let (mut prev, ..) = setup_graph("/refs/genome.fa");
        let mut db = MemoryJobDatabase::new();
        let prev_ids = prev.ids().collect::<Vec<_>>();
        save_jobs(&mut db, &mut prev, &prev_ids).unwrap();
        let records = prev_ids
            .iter()
            .map(|id| prev.job(*id).unwrap().record.unwrap())
            .collect::<Vec<_>>();
        db.update_state(records[0], JobState::Failed).unwrap();

        let (mut g, index, gem, _) = setup_graph("/refs/genome.fa");
        let ids = g.ids().collect::<Vec<_>>();
        let kept = check_jobs_dependencies(&mut g, &ids, &mut db).unwrap();

        assert_eq!(kept, ids);
        assert_eq!(g.job(gem).unwrap().dependencies, vec![index]);
        assert_eq!(db.deleted(), &[records[2], records[1], records[0]]);
        assert!(db.jobs().unwrap().is_empty());
    }

    #[test]
    fn every_matching_prior_is_checked() {
        let (mut prev, ..) = setup_graph("/refs/genome.fa");
        let mut db = MemoryJobDatabase::new();
        let prev_ids = prev.ids().collect::<Vec<_>>();
        save_jobs(&mut db, &mut prev, &prev_ids).unwrap();
        let failed = prev.job(JobId(0)).unwrap().record.unwrap();
        db.update_state(failed, JobState::Failed).unwrap();

        // a later submission of the same index that is still alive
        let mut again = PersistedJob::from_job(prev.job(JobId(0)).unwrap());
        again.id = 0;
        again.state = JobState::Running;
        let live = db.save_job(again).unwrap();

        let (mut g, index, gem, _) = setup_graph("/refs/genome.fa");
        let matches = get_setup_jobs(&g, gem, &db).unwrap();
        assert_eq!(matches.iter().map(|m| m.prior.id).collect::<Vec<_>>(), vec![failed, live]);

        let ids = g.ids().collect::<Vec<_>>();
        let kept = check_jobs_dependencies(&mut g, &ids, &mut db).unwrap();
        assert!(db.get(failed).unwrap().is_none());
        assert!(!kept.contains(&index));

        let reused = g.job(gem).unwrap().dependencies[0];
        assert_eq!(g.job(reused).unwrap().record, Some(live));
    }

    #[test]
    fn different_inputs_do_not_match() {
        let (mut prev, ..) = setup_graph("/refs/genome.fa");
        let mut db = MemoryJobDatabase::new();
        let prev_ids = prev.ids().collect::<Vec<_>>();
        save_jobs(&mut db, &mut prev, &prev_ids).unwrap();

        let (mut g, ..) = setup_graph("/refs/other.fa");
        let ids = g.ids().collect::<Vec<_>>();
        assert_eq!(check_jobs_dependencies(&mut g, &ids, &mut db).unwrap(), ids);
    }
}
