//! Recovery and validation tests.

use std::path::Path;

use dcfh::recovery::{DenyPrompt, FixMode};
use dcfh::{OperationOptions, Repository};

use dcfh_datastore::{load_entry_map, IndexContext, IndexError, ValidationMode};

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

fn clear_clean_flag(path: &Path) {
    let mut data = std::fs::read(path).unwrap();
    // flags field at offset 20, clean is bit 1
    data[20] &= !0x02;
    std::fs::write(path, &data).unwrap();
}

#[test]
fn unclean_main_fails_strict_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"A");
    write(dir.path(), "b/c.txt", b"BC");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    clear_clean_flag(&repo.main_index_path());

    // strict loading refuses the unclean file
    let err = repo.status(&opts()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::UncleanFile)
    ));

    // recovery loading salvages all structurally valid entries
    let (salvaged, _) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Recovery,
    )
    .unwrap();
    assert_eq!(salvaged.len(), 2);
    drop(salvaged);

    repo.recover(&opts(), FixMode::Auto, &mut DenyPrompt).unwrap();

    // pre-recovery snapshot was taken
    assert!(repo.meta_dir().join("recovery/main.idx").exists());

    // consistent pair: clean status, no cache, no scan files
    let report = repo.status(&opts()).unwrap();
    assert!(report.is_empty());
    assert!(!repo.cache_index_path().exists());
    let scans: Vec<_> = std::fs::read_dir(repo.meta_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("scan-"))
        .collect();
    assert!(scans.is_empty());

    // the recovered index carries the full content again
    let (map, defects) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();
    assert!(defects.is_empty());
    let paths: Vec<&str> = map.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["a.txt", "b/c.txt"]);
    assert!(map.get("a.txt").unwrap().entry.resolve().has_hash());
}

#[test]
fn truncated_main_recovers() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "one.txt", b"1");
    write(dir.path(), "two.txt", b"2");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    // simulate a crash mid write: lose the tail of the last entry
    let main_path = repo.main_index_path();
    let len = std::fs::metadata(&main_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&main_path)
        .unwrap();
    file.set_len(len - 24).unwrap();
    drop(file);

    let err = repo.status(&opts()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::ChecksumMismatch)
    ));

    repo.recover(&opts(), FixMode::Auto, &mut DenyPrompt).unwrap();

    let report = repo.status(&opts()).unwrap();
    assert!(report.is_empty());

    let (map, _) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();
    let paths: Vec<&str> = map.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["one.txt", "two.txt"]);
}

#[test]
fn recovery_marks_missing_files_deleted_before_rescan() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "stays.txt", b"s");
    write(dir.path(), "goes.txt", b"g");

    let repo = Repository::open(dir.path()).unwrap();
    repo.update(&[], &opts()).unwrap();

    std::fs::remove_file(dir.path().join("goes.txt")).unwrap();
    clear_clean_flag(&repo.main_index_path());

    repo.recover(&opts(), FixMode::Auto, &mut DenyPrompt).unwrap();

    let (map, _) = load_entry_map(
        &repo.main_index_path(),
        IndexContext::Main,
        ValidationMode::Strict,
    )
    .unwrap();
    let paths: Vec<&str> = map.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec!["stays.txt"]);
}

#[test]
fn lenient_load_drops_defective_entries() {
    use dcfh_datastore::entry::EntryMeta;
    use dcfh_datastore::index_file::ScanIndexWriter;
    use dcfh_datastore::{digest_by_name, wall_time};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan-1-9.idx");
    let kind = digest_by_name("sha256").unwrap();

    let good_meta = EntryMeta {
        ctime: wall_time::pack(1_600_000_000, 0),
        mtime: wall_time::pack(1_600_000_000, 0),
        dev: 1,
        ino: 1,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        file_size: 1,
    };
    // mtime far in the future is out of the accepted range
    let bad_meta = EntryMeta {
        mtime: wall_time::pack(4_000_000_000, 0),
        ..good_meta
    };

    let mut writer = ScanIndexWriter::create(&path, kind).unwrap();
    let good = writer.append_new("good", &good_meta).unwrap();
    good.write_hash(kind.type_id, &kind.digest(b"x").unwrap());
    let bad = writer.append_new("zz-bad", &bad_meta).unwrap();
    bad.write_hash(kind.type_id, &kind.digest(b"y").unwrap());
    writer.finish().unwrap();

    let err = load_entry_map(&path, IndexContext::Scan, ValidationMode::Strict).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::EntryCorrupt { .. })
    ));

    let (map, defects) =
        load_entry_map(&path, IndexContext::Scan, ValidationMode::Lenient).unwrap();
    assert_eq!(map.len(), 1);
    assert!(map.get("good").is_some());
    assert_eq!(defects.len(), 1);

    let (map, defects) =
        load_entry_map(&path, IndexContext::Scan, ValidationMode::Diagnostic).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(defects.len(), 1);
}
