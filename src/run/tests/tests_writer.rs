use tempfile::TempDir;

use super::helpers::*;
use crate::run::{Run, RunEnv, RunError, writer::RunWriter};

/// # Scenario
/// Commit produces a durable `<id>.run` file whose footer carries the
/// statement count, LSN window, and key bounds; the temp file is gone.
#[test]
fn commit_writes_footer_and_renames() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();

    let stmts = vec![
        replace(b"a", b"1", 4),
        replace(b"b", b"2", 9),
        replace(b"c", b"3", 6),
    ];
    let run = build_run(&env, 1, 9, &stmts);

    assert!(env.run_path(1).exists());
    assert!(!env.tmp_path(1).exists());
    assert_eq!(run.info.stmt_count, 3);
    assert_eq!(run.info.min_lsn, 4);
    assert_eq!(run.info.max_lsn, 9);
    assert_eq!(run.info.min_key.as_ref().unwrap().0[0], b"a".to_vec());
    assert_eq!(run.info.max_key.as_ref().unwrap().0[0], b"c".to_vec());
    assert_eq!(run.dump_lsn, 9);
}

/// # Scenario
/// Abort removes the temp file and no committed file ever appears.
#[test]
fn abort_leaves_no_files() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();

    let cmp = cmp_def();
    let mut writer = RunWriter::create(&env, 2, 0.01, 512).unwrap();
    for (key, stmt) in sort_for_run(&cmp, &[replace(b"x", b"y", 1)]) {
        writer.append(&key, stmt).unwrap();
    }
    writer.abort();

    assert!(!env.run_path(2).exists());
    assert!(!env.tmp_path(2).exists());
}

/// # Scenario
/// Statements spanning several page-sized blocks all come back in order.
#[test]
fn multi_block_runs_read_back_in_order() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();

    let stmts: Vec<_> = (0..200u32)
        .map(|i| replace(format!("k{i:04}").as_bytes(), &[b'v'; 64], u64::from(i) + 1))
        .collect();
    let run = build_run(&env, 3, 200, &stmts);
    assert_eq!(run.info.stmt_count, 200);

    let cmp = cmp_def();
    let keys: Vec<Vec<u8>> = run
        .iter(&cmp)
        .map(|item| item.unwrap().0.0[0].clone())
        .collect();
    assert_eq!(keys.len(), 200);
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

/// # Scenario
/// An armed fault fails the append with `RunError::Injected` and the run
/// can still be aborted cleanly.
#[test]
fn injected_write_failure_surfaces() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();
    let cmp = cmp_def();

    let mut writer = RunWriter::create(&env, 4, 0.01, 512).unwrap();
    env.faults.fail_run_writes(1);
    let (key, stmt) = sort_for_run(&cmp, &[replace(b"a", b"b", 1)])
        .pop()
        .unwrap();
    let err = writer.append(&key, stmt).unwrap_err();
    assert!(matches!(err, RunError::Injected));
    writer.abort();
    assert!(!env.tmp_path(4).exists());
}

/// # Scenario
/// The bloom filter answers "maybe" for present keys; a missing key is
/// usually ruled out at 1% FPR.
#[test]
fn bloom_filter_covers_written_keys() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();

    let stmts: Vec<_> = (0..100u32)
        .map(|i| replace(format!("key{i}").as_bytes(), b"v", u64::from(i) + 1))
        .collect();
    let run = build_run(&env, 5, 100, &stmts);

    let cmp = cmp_def();
    for i in 0..100u32 {
        let key = cmp.extract(&replace(format!("key{i}").as_bytes(), b"v", 1).tuple);
        assert!(run.may_contain(&key));
    }
    let absent: usize = (0..100u32)
        .filter(|i| {
            let key = cmp.extract(&replace(format!("absent{i}").as_bytes(), b"v", 1).tuple);
            run.may_contain(&key)
        })
        .count();
    assert!(absent < 20, "bloom false-positive rate far above target");
}

/// # Scenario
/// Opening a truncated run file is an error, not a panic.
#[test]
fn truncated_run_fails_to_open() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();
    build_run(&env, 6, 1, &[replace(b"a", b"b", 1)]);

    let path = env.run_path(6);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    assert!(Run::open(&env, 6, 1).is_err());
}
