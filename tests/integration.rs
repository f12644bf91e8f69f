use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn medcorpus_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("medcorpus");
    path
}

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn article(title: &str, body: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\"?>\n<article><front><article-meta><title-group>\
         <article-title>{}</article-title></title-group></article-meta></front>\
         <body><p>{}</p></body></article>",
        title, body
    )
    .into_bytes()
}

/// A local "remote" with two archive batches:
/// - `batch1.tar.gz`: two articles plus a malformed one,
/// - `batch2.tar.gz`: a nested `inner.tar.gz` holding one article.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let bucket = root.join("bucket/oa_bulk");
    fs::create_dir_all(&bucket).unwrap();

    let a = article("Heart rate variability in athletes", "HRV was measured.");
    let b = article("Sleep staging with wrist sensors", "Accelerometry &amp; PPG.");
    fs::write(
        bucket.join("batch1.tar.gz"),
        tar_gz(&[
            ("PMC0001/PMC0001.xml", &a),
            ("PMC0002/PMC0002.xml", &b),
            ("PMC0003/PMC0003.xml", b"<article><p>truncated"),
            ("PMC0001/figure1.jpg", b"\xff\xd8\xff"),
        ]),
    )
    .unwrap();

    let c = article("Continuous glucose monitoring", "CGM traces.");
    let inner = tar_gz(&[("PMC0004.xml", &c)]);
    fs::write(
        bucket.join("batch2.tar.gz"),
        tar_gz(&[("inner.tar.gz", &inner)]),
    )
    .unwrap();
    fs::write(bucket.join("README.txt"), "not an archive").unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[paths]
downloads = "{root}/downloads"
extracted = "{root}/extracted"
processed = "{root}/processed_data"
log_file = "{root}/processing_log.txt"

[remote]
kind = "local"
root = "{root}/bucket"
prefix = "oa_bulk/"

[processing]
batch_size = 2
workers = 2

[corpus]
path = "{root}/chroma_db"
collection = "medical_articles"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("medcorpus.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_medcorpus(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = medcorpus_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run medcorpus binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn root_of(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().to_path_buf()
}

#[test]
fn test_fetch_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let root = root_of(&config_path);

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["fetch"]);
    assert!(success, "fetch failed: {}", stderr);
    assert!(stdout.contains("archives matched: 2"), "{}", stdout);
    assert!(stdout.contains("downloaded: 2"), "{}", stdout);
    assert!(root.join("downloads/batch1.tar.gz").exists());
    assert!(root.join("downloads/batch2.tar.gz").exists());
    assert!(!root.join("downloads/README.txt").exists());

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["fetch"]);
    assert!(success, "second fetch failed: {}", stderr);
    assert!(stdout.contains("downloaded: 0"), "{}", stdout);
    assert!(stdout.contains("already present: 2"), "{}", stdout);
}

#[test]
fn test_fetch_limit() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_medcorpus(&config_path, &["fetch", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("downloaded: 1"), "{}", stdout);

    let (stdout, _, success) = run_medcorpus(&config_path, &["fetch", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("downloaded: 1"), "{}", stdout);
    assert!(stdout.contains("already present: 1"), "{}", stdout);
}

#[test]
fn test_extract_unwraps_nested_archive() {
    let (_tmp, config_path) = setup_test_env();
    let root = root_of(&config_path);
    run_medcorpus(&config_path, &["fetch"]);

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["extract"]);
    assert!(success, "extract failed: {}", stderr);
    assert!(stdout.contains("extracted: 2"), "{}", stdout);
    assert!(stdout.contains("nested archives unpacked: 1"), "{}", stdout);

    assert!(root.join("extracted/batch1/PMC0001/PMC0001.xml").exists());
    assert!(root.join("extracted/batch2/PMC0004.xml").exists());
    assert!(!root.join("extracted/batch2/inner.tar.gz").exists());
}

#[test]
fn test_process_logs_every_document() {
    let (_tmp, config_path) = setup_test_env();
    let root = root_of(&config_path);
    run_medcorpus(&config_path, &["fetch"]);
    run_medcorpus(&config_path, &["extract"]);

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["process"]);
    assert!(success, "process failed: {}", stderr);
    assert!(stdout.contains("documents discovered: 4"), "{}", stdout);
    assert!(stdout.contains("transformed: 3"), "{}", stdout);
    assert!(stdout.contains("failed: 1"), "{}", stdout);
    assert!(stdout.contains("batches: 2 / 2"), "{}", stdout);

    let log = fs::read_to_string(root.join("processing_log.txt")).unwrap();
    assert_eq!(log.lines().count(), 4);
    assert_eq!(log.lines().filter(|l| l.starts_with("Processed: ")).count(), 3);
    assert!(log
        .lines()
        .any(|l| l.starts_with("Error processing ") && l.contains("PMC0003.xml")));

    let processed = root.join("processed_data");
    assert!(processed.join("PMC0001.xml.json").exists());
    assert!(processed.join("PMC0004.xml.json").exists());
    assert!(!processed.join("PMC0003.xml.json").exists());

    let record: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(processed.join("PMC0002.xml.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(record["filename"], "PMC0002.xml");
    assert_eq!(record["title"], "Sleep staging with wrist sensors");
    assert!(record["text"]
        .as_str()
        .unwrap()
        .contains("Accelerometry & PPG."));
}

#[test]
fn test_process_max_batches_then_resume() {
    let (_tmp, config_path) = setup_test_env();
    let root = root_of(&config_path);
    run_medcorpus(&config_path, &["fetch"]);
    run_medcorpus(&config_path, &["extract"]);

    let (stdout, stderr, success) = run_medcorpus(
        &config_path,
        &["process", "--batch-size", "1", "--max-batches", "1"],
    );
    assert!(success, "process failed: {}", stderr);
    assert!(stdout.contains("batches: 1 / 4"), "{}", stdout);
    let log = fs::read_to_string(root.join("processing_log.txt")).unwrap();
    assert_eq!(log.lines().count(), 1);

    let (stdout, _, success) = run_medcorpus(&config_path, &["process", "--resume"]);
    assert!(success);
    assert!(stdout.contains("documents discovered: 4"), "{}", stdout);
    let log = fs::read_to_string(root.join("processing_log.txt")).unwrap();
    assert_eq!(log.lines().count(), 5);
}

#[test]
fn test_run_loads_corpus() {
    let (_tmp, config_path) = setup_test_env();
    let root = root_of(&config_path);

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["run"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("loaded: 3"), "{}", stdout);
    assert!(stdout.contains("pending embeddings: 3"), "{}", stdout);
    assert!(root.join("chroma_db/corpus.sqlite").exists());

    let (stdout, _, success) = run_medcorpus(&config_path, &["load"]);
    assert!(success);
    assert!(stdout.contains("unchanged: 3"), "{}", stdout);

    let (stdout, stderr, success) = run_medcorpus(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Entries:     3"), "{}", stdout);
    assert!(stdout.contains("Records:     3"), "{}", stdout);
}

#[test]
fn test_query_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_medcorpus(&config_path, &["query", "heart rate"]);
    assert!(!success);
    assert!(stderr.contains("embedding provider"), "{}", stderr);
}

#[test]
fn test_fetch_without_remote_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("medcorpus.toml");
    fs::write(&config_path, "[processing]\nbatch_size = 10\n").unwrap();

    let (_, stderr, success) = run_medcorpus(&config_path, &["fetch"]);
    assert!(!success);
    assert!(stderr.contains("[remote]"), "{}", stderr);
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("medcorpus.toml");
    fs::write(&config_path, "[processing]\nbatch_size = 0\n").unwrap();

    let (_, stderr, success) = run_medcorpus(&config_path, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("batch_size"), "{}", stderr);
}
