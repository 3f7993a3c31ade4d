//! End to end workflow tests on real temp directories.

use std::path::Path;

use dcfh::{OperationOptions, Repository, WorkflowError};

use dcfh_datastore::{load_entry_map, IndexContext, ValidationMode};

fn opts() -> OperationOptions {
    OperationOptions::new()
}

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[test]
fn empty_repository() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path()).unwrap();

    let report = repo.status(&opts()).unwrap();
    assert!(report.modified.is_empty());
    assert!(report.added.is_empty());
    assert!(report.deleted.is_empty());

    // main.idx contains only the header, cache.idx is absent
    assert_eq!(
        std::fs::metadata(repo.main_index_path()).unwrap().len(),
        88
    );
    assert!(!repo.cache_index_path().exists());
}

#[test]
fn update_commits_sorted_entries() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"A");
    write(dir.path(), "b/c.txt", b"BC");
    write(dir.path(), "d.txt", b"D");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    let (map, defects) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();
    assert!(defects.is_empty());

    let paths: Vec<&str> = map.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["a.txt", "b/c.txt", "d.txt"]);

    let entry = map.get("a.txt").unwrap().entry.resolve();
    assert_eq!(entry.file_size, 1);
    assert_eq!(
        hex::encode(entry.hash_slice().unwrap()),
        "559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd"
    );

    // no scan or temp leftovers
    let stray: Vec<_> = std::fs::read_dir(repo.meta_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("scan-") || n.ends_with(".tmp"))
        .collect();
    assert!(stray.is_empty(), "leftover files: {:?}", stray);
}

#[test]
fn status_classifies_changes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"A");
    write(dir.path(), "b/c.txt", b"BC");
    write(dir.path(), "d.txt", b"D");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    // clean tree: empty report, no cache file
    let report = repo.status(&opts()).unwrap();
    assert!(report.is_empty());
    assert!(!repo.cache_index_path().exists());

    write(dir.path(), "a.txt", b"AA");
    write(dir.path(), "e.txt", b"E");
    std::fs::remove_file(dir.path().join("d.txt")).unwrap();

    let report = repo.status(&opts()).unwrap();
    assert_eq!(report.modified, vec!["a.txt".to_string()]);
    assert_eq!(report.added, vec!["e.txt".to_string()]);
    assert_eq!(report.deleted, vec!["d.txt".to_string()]);

    // pending changes land in the cache, committed entries stay out
    let (cache, _) = load_entry_map(
        &repo.cache_index_path(),
        IndexContext::Cache,
        ValidationMode::Strict,
    )
    .unwrap();
    let cached: Vec<&str> = cache.iter().map(|(path, _)| path).collect();
    assert_eq!(cached, vec!["a.txt", "d.txt", "e.txt"]);
    assert!(cache.get("d.txt").unwrap().entry.resolve().is_deleted());

    // a second status reports the same
    let again = repo.status(&opts()).unwrap();
    assert_eq!(again.modified, vec!["a.txt".to_string()]);
    assert_eq!(again.added, vec!["e.txt".to_string()]);
    assert_eq!(again.deleted, vec!["d.txt".to_string()]);

    // committing clears everything
    repo.update(&[], &opts()).unwrap();
    let clean = repo.status(&opts()).unwrap();
    assert!(clean.is_empty());
    assert!(!repo.cache_index_path().exists());
}

#[test]
fn update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "one", b"1");
    write(dir.path(), "sub/two", b"22");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();
    let first = std::fs::read(repo.main_index_path()).unwrap();

    repo.update(&[], &opts()).unwrap();
    let second = std::fs::read(repo.main_index_path()).unwrap();

    assert_eq!(first, second);
}

#[test]
fn partial_update_with_paths() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "keep.txt", b"K");
    write(dir.path(), "sub/inner.txt", b"I");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    write(dir.path(), "keep.txt", b"KK");
    write(dir.path(), "sub/inner.txt", b"II");

    // commit only the subtree; keep.txt stays modified
    repo.update(&[dir.path().join("sub")], &opts()).unwrap();

    let report = repo.status(&opts()).unwrap();
    assert_eq!(report.modified, vec!["keep.txt".to_string()]);
    assert!(report.added.is_empty());
    assert!(report.deleted.is_empty());
}

#[test]
fn duplicate_detection() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "x1", b"same bytes");
    write(dir.path(), "x2", b"same bytes");
    write(dir.path(), "z", b"different");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    let groups = repo.find_duplicates(&opts()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].paths, vec!["x1".to_string(), "x2".to_string()]);

    // an uncommitted copy joins the group through the cache
    write(dir.path(), "x3", b"same bytes");
    let groups = repo.find_duplicates(&opts()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].paths,
        vec!["x1".to_string(), "x2".to_string(), "x3".to_string()]
    );
}

#[test]
fn symlinks_hash_their_target_string() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "real.txt", b"content");
    std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    let (map, _) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();

    let link = map.get("link").unwrap().entry.resolve();
    let expected = dcfh_datastore::digest_by_name("sha256")
        .unwrap()
        .digest(b"real.txt")
        .unwrap();
    assert_eq!(link.hash_slice().unwrap(), &expected[..]);
}

#[test]
fn fired_shutdown_interrupts_and_preserves_main() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"A");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();
    let before = std::fs::read(repo.main_index_path()).unwrap();

    write(dir.path(), "b.txt", b"B");

    let interrupted = opts();
    interrupted.shutdown.fire();
    let err = repo.status(&interrupted).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Interrupted)
    ));

    // the main index is byte identical, no scan files remain
    assert_eq!(std::fs::read(repo.main_index_path()).unwrap(), before);
    let scans: Vec<_> = std::fs::read_dir(repo.meta_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("scan-"))
        .collect();
    assert!(scans.is_empty());

    // a later uninterrupted run works normally
    let report = repo.status(&opts()).unwrap();
    assert_eq!(report.added, vec!["b.txt".to_string()]);
}

#[test]
fn ignore_patterns_exclude_paths() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "kept.txt", b"k");
    write(dir.path(), "build/out.o", b"o");

    let repo = Repository::open(dir.path()).unwrap();
    std::fs::write(repo.meta_dir().join("ignore"), b"# build artifacts\n^build/\n").unwrap();

    repo.update(&[], &opts()).unwrap();

    let (map, _) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();
    let paths: Vec<&str> = map.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["kept.txt"]);
}

#[test]
fn no_wait_fails_when_scan_runs() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "f", b"f");
    let repo = Repository::open(dir.path()).unwrap();

    // hold the scan lock from another thread for a moment
    let repo2 = Repository::open(dir.path()).unwrap();
    let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
    let barrier2 = std::sync::Arc::clone(&barrier);
    let holder = std::thread::spawn(move || {
        let slow = opts();
        barrier2.wait();
        repo2.update(&[], &slow).unwrap();
    });
    barrier.wait();

    let mut no_wait = opts();
    no_wait.wait = false;
    // the update may already have finished; only a lock conflict counts
    // as AlreadyRunning, anything else must be success
    match repo.status(&no_wait) {
        Ok(_) => (),
        Err(err) => assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::AlreadyRunning)
        )),
    }

    holder.join().unwrap();
}
