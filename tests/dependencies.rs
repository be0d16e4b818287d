use grape::*;
use serde_json::json;

fn config() -> Config {
    Config::from_value(json!({
        "genome": "/refs/genome.fa",
        "annotation": "/refs/gencode.gtf",
        "quality": "33",
    }))
}

fn datasets(ids: &[&str]) -> Vec<Dataset> {
    let mut index = Index::new(None);
    for id in ids {
        for mate in [1, 2] {
            let mut fields = Metadata::new();
            fields.set("labExpId", *id).unwrap();
            fields.set("readType", "2x76D").unwrap();
            fields.set("type", "fastq").unwrap();
            fields.set("path", format!("/project/data/fastq/{id}_{mate}.fastq.gz")).unwrap();
            index.insert(&fields, false).unwrap();
        }
    }
    index.datasets().cloned().collect()
}

fn graph_for(ids: &[&str]) -> JobGraph {
    let config = config();
    let pipelines = datasets(ids)
        .iter()
        .map(|d| default_pipeline(d, &config))
        .collect::<Result<Vec<_>>>()
        .unwrap();
    create_jobs(&pipelines, |_| Ok(JobConfig::default())).unwrap()
}

fn names(graph: &JobGraph, ids: &[JobId]) -> Vec<String> {
    ids.iter().map(|id| graph.job(*id).unwrap().name.clone()).collect()
}

#[test]
fn setup_jobs_are_shared_between_pipelines() {
    let graph = graph_for(&["a", "b"]);
    assert_eq!(graph.len(), 6);

    let t_index = graph.find("t_index.genome").unwrap();
    for aligner in ["gem.a", "gem.b"] {
        let gem = graph.job(graph.find(aligner).unwrap()).unwrap();
        assert!(gem.dependencies.contains(&t_index));
    }
    let index = graph.find("index.genome").unwrap();
    assert_eq!(graph.job(t_index).unwrap().dependencies, vec![index]);
}

#[test]
fn stored_setup_jobs_are_not_scheduled_again() {
    let mut db = MemoryJobDatabase::new();
    let mut first = graph_for(&["a", "b"]);
    let ids = first.ids().collect::<Vec<_>>();
    save_jobs(&mut db, &mut first, &ids).unwrap();
    let index_record = first.job(first.find("index.genome").unwrap()).unwrap().record;
    let t_index_record = first.job(first.find("t_index.genome").unwrap()).unwrap().record;

    let mut second = graph_for(&["c"]);
    let ids = second.ids().collect::<Vec<_>>();
    let kept = check_jobs_dependencies(&mut second, &ids, &mut db).unwrap();
    assert_eq!(names(&second, &kept), vec!["gem.c", "flux.c"]);

    let gem = second.job(second.find("gem.c").unwrap()).unwrap();
    let records = gem
        .dependencies
        .iter()
        .map(|d| second.job(*d).unwrap().record)
        .collect::<Vec<_>>();
    assert!(records.contains(&index_record));
    assert!(records.contains(&t_index_record));

    let order = second.topological_order(&kept).unwrap();
    assert_eq!(names(&second, &order), vec!["gem.c", "flux.c"]);
}

#[test]
fn failed_setup_jobs_are_removed_with_their_children() {
    let mut db = MemoryJobDatabase::new();
    let mut first = graph_for(&["a"]);
    let ids = first.ids().collect::<Vec<_>>();
    save_jobs(&mut db, &mut first, &ids).unwrap();
    let index_record = first
        .job(first.find("index.genome").unwrap())
        .unwrap()
        .record
        .unwrap();
    db.update_state(index_record, JobState::Failed).unwrap();

    let mut second = graph_for(&["b"]);
    let ids = second.ids().collect::<Vec<_>>();
    let kept = check_jobs_dependencies(&mut second, &ids, &mut db).unwrap();

    assert_eq!(kept, ids);
    assert!(db.jobs().unwrap().is_empty());
    assert_eq!(db.deleted().len(), 4);
    assert_eq!(db.deleted().last(), Some(&index_record));
}

#[test]
fn configured_index_skips_genome_indexing() {
    let mut config = config();
    config.set("index", "/refs/genome.gem");
    let pipelines = datasets(&["a"])
        .iter()
        .map(|d| default_pipeline(d, &config))
        .collect::<Result<Vec<_>>>()
        .unwrap();
    let graph = create_jobs(&pipelines, |_| Ok(JobConfig::default())).unwrap();

    assert!(graph.find("index.genome").is_none());
    let ids = graph.ids().collect::<Vec<_>>();
    let order = graph.topological_order(&ids).unwrap();
    assert_eq!(names(&graph, &order), vec!["t_index.genome", "gem.a", "flux.a"]);
}
