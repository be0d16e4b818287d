use std::fs;
use std::time::Duration;

use grape::parse_utils::parse_line;
use grape::{Error, FileType, Index, IndexFormat, Metadata};

const INDEX: &str = "\
./data/test_1.fastq.gz\tlabExpId=test; type=fastq; view=FastqRd1; quality=33; sex=female;
./data/test_2.fastq.gz\tlabExpId=test; type=fastq; view=FastqRd2; quality=33; sex=female;
./data/test.bam\tlabExpId=test; type=bam; view=Alignments; quality=33; sex=female;
.\tlabExpId=meta; quality=64;
";

fn index_in(dir: &std::path::Path) -> Index {
    let path = dir.join(".index");
    fs::write(&path, INDEX).unwrap();
    let mut index = Index::new(Some(path));
    assert_eq!(index.open().unwrap(), 0);
    index
}

#[test]
fn load_groups_files_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_in(dir.path());

    assert_eq!(index.len(), 2);
    let d = index.get("test").unwrap();
    assert_eq!(d.get("quality"), Some("33"));
    assert_eq!(d.files(&FileType::Fastq).len(), 2);
    assert_eq!(d.files(&FileType::Bam)[0].view(), Some("Alignments"));
    assert_eq!(d.primary(), Some("./data/test_1.fastq.gz"));
    assert_eq!(d.secondary(), Some("./data/test_2.fastq.gz"));

    let meta = index.get("meta").unwrap();
    assert_eq!(meta.num_files(), 0);
    assert_eq!(meta.get("quality"), Some("64"));
}

#[test]
fn save_and_reload_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_in(dir.path());
    index.save().unwrap();
    let first = fs::read_to_string(dir.path().join(".index")).unwrap();

    let mut again = Index::new(Some(dir.path().join(".index")));
    again.open().unwrap();
    again.save().unwrap();
    let second = fs::read_to_string(dir.path().join(".index")).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.lines().count(), 4);
    assert!(first.ends_with('\n'));
}

type Entry = (String, Vec<(String, String)>);

fn entries(text: &str) -> Vec<Entry> {
    let mut res = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let (path, mut tags) = parse_line(l).unwrap();
            tags.sort();
            (path.to_owned(), tags)
        })
        .collect::<Vec<_>>();
    res.sort();
    res
}

#[test]
fn export_reproduces_loaded_entries() {
    let source = "\
./data/b_2.fastq\tview=FastqRd2; type=fastq; labExpId=b; sex=male; size=10;
./data/b_1.fastq\tlabExpId=b; sex=male; type=fastq; view=FastqRd1; size=12;
./data/a.bam\ttype=bam; labExpId=a; tissue=Liver; md5=0cc175b9c0f1b6a831c399e269772661;
./data/a.bam.bai\tlabExpId=a; tissue=Liver; type=bai;
.\tlabExpId=m; quality=64; tissue=Blood;
";
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".index");
    fs::write(&path, source).unwrap();

    let mut index = Index::new(Some(path.clone()));
    assert_eq!(index.open().unwrap(), 0);
    index.save().unwrap();

    let mut reloaded = Index::new(Some(path.clone()));
    reloaded.open().unwrap();
    let mut out = Vec::new();
    reloaded.export(&mut out, false).unwrap();

    assert_eq!(entries(&String::from_utf8(out).unwrap()), entries(source));
    assert_eq!(entries(&fs::read_to_string(&path).unwrap()), entries(source));
}

#[test]
fn reload_does_not_duplicate_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = index_in(dir.path());
    index.open().unwrap();
    assert_eq!(index.get("test").unwrap().num_files(), 3);
}

#[test]
fn malformed_lines_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".index");
    fs::write(&path, format!("{INDEX}no tab here\n./x.fastq\tquality=33;\n")).unwrap();

    let mut index = Index::new(Some(path));
    assert_eq!(index.open().unwrap(), 2);
    assert_eq!(index.skipped(), 2);
    assert_eq!(index.len(), 2);
}

#[test]
fn custom_id_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".index");
    fs::write(&path, "./a.fastq\tsample=s1; type=fastq;\n").unwrap();

    let format = IndexFormat::parse(r#"{"id": "sample"}"#).unwrap();
    let mut index = Index::with_format(Some(path), format);
    index.open().unwrap();
    assert_eq!(index.get("s1").unwrap().id_field(), "sample");
}

#[test]
fn import_tab_separated() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("meta.tsv");
    fs::write(&csv, "id\tquality\tsex\ns1\t33\tmale\ns2\t64\t\ntest\t10\tmale\n").unwrap();

    let mut index = index_in(dir.path());
    assert_eq!(index.import_delimited(&csv, None, None).unwrap(), 2);

    let s1 = index.get("s1").unwrap();
    assert_eq!(s1.get("labExpId"), Some("s1"));
    assert_eq!(s1.get("sex"), Some("male"));
    assert_eq!(index.get("s2").unwrap().get("sex"), None);
    // known ids keep their tags
    assert_eq!(index.get("test").unwrap().get("quality"), Some("33"));
}

#[test]
fn import_comma_separated_with_paths() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("meta.csv");
    fs::write(&csv, "labExpId,path,type,quality\nx,./x.bam,bam,33\n").unwrap();

    let mut index = Index::new(None);
    assert_eq!(index.import_delimited(&csv, None, Some("labExpId")).unwrap(), 1);
    assert_eq!(index.get("x").unwrap().files(&FileType::Bam).len(), 1);
}

#[test]
fn import_maps_id_column() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("meta.csv");
    fs::write(&csv, "sample,labExpId,sex\ns1,old,male\n").unwrap();

    let mut index = Index::new(None);
    assert_eq!(index.import_delimited(&csv, None, Some("sample")).unwrap(), 1);
    let s1 = index.get("s1").unwrap();
    assert_eq!(s1.get("labExpId"), Some("s1"));
    assert_eq!(s1.get("sex"), Some("male"));
    assert!(s1.get("sample").is_none());
    assert!(index.get("old").is_none());
}

#[test]
fn import_repeated_header_keeps_last_value() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("meta.tsv");
    fs::write(&csv, "labExpId\tsex\tsex\nr1\tmale\tfemale\nr2\tmale\t\n").unwrap();

    let mut index = Index::new(None);
    assert_eq!(index.import_delimited(&csv, None, None).unwrap(), 2);
    assert_eq!(index.get("r1").unwrap().get("sex"), Some("female"));
    assert_eq!(index.get("r2").unwrap().get("sex"), Some("male"));
}

#[test]
fn second_lock_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".index");

    let mut first = Index::new(Some(path.clone()));
    assert!(first.lock().unwrap());

    let mut second = Index::new(Some(path)).with_lock_timeout(Duration::from_millis(200));
    assert!(matches!(second.lock(), Err(Error::LockingFailed { .. })));

    assert!(first.release());
    assert!(second.lock().unwrap());
}

#[test]
fn unsupported_types_are_rejected() {
    let mut index = Index::new(None);
    let mut fields = Metadata::new();
    fields.set("labExpId", "x").unwrap();
    fields.set("path", "./x.xyz").unwrap();
    fields.set("type", "xyz").unwrap();
    assert!(matches!(index.insert(&fields, false), Err(Error::UnsupportedFileType(_))));
}

#[test]
fn select_by_id_and_filter() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_in(dir.path());

    let by_filter = index.select(&[], &[("quality".to_owned(), "64".to_owned())]);
    assert_eq!(by_filter.ids().collect::<Vec<_>>(), vec!["meta"]);

    let by_id = index.select(&["test".to_owned()], &[]);
    assert_eq!(by_id.len(), 1);
    assert!(by_id.path().is_none());
}
