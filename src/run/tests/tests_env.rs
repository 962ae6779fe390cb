use std::sync::Arc;

use tempfile::TempDir;

use super::helpers::*;
use crate::fault::FaultInjector;
use crate::metalog::{MetaLog, MetaRecord};
use crate::run::RunEnv;

/// # Scenario
/// Recovery sweep deletes files the metadata log does not account for —
/// leftover temp files, forgotten runs, and dropped runs created after
/// the last checkpoint — and keeps committed and checkpoint-retained
/// dropped ones.
#[test]
fn sweep_removes_orphans_and_keeps_accounted_runs() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path().join("runs")).unwrap();
    let log = MetaLog::open(dir.path().join("meta"), Arc::new(FaultInjector::new())).unwrap();
    let lsm = log.next_id();

    // Committed run, retained dropped run, forgotten run, post-checkpoint
    // dropped run, and a stray tmp.
    for id in [1u64, 2, 3, 5] {
        build_run(&env, id, id, &[replace(b"k", b"v", id)]);
    }
    std::fs::write(env.tmp_path(4), b"partial").unwrap();

    let mut tx = log.begin();
    for id in [1u64, 2, 3, 5] {
        tx.write(MetaRecord::CreateRun {
            lsm_id: lsm,
            run_id: id,
            dump_lsn: id,
        });
    }
    tx.write(MetaRecord::DropRun {
        run_id: 2,
        gc_lsn: 10,
    });
    tx.write(MetaRecord::ForgetRun { run_id: 3 });
    // Dumped at LSN 5, dropped with gc LSN 2: created after the last
    // checkpoint, so a crash before the follow-up removal left an orphan.
    tx.write(MetaRecord::DropRun {
        run_id: 5,
        gc_lsn: 2,
    });
    tx.commit().unwrap();

    let removed = env.sweep_orphans(&log.replay().unwrap()).unwrap();
    assert_eq!(removed, 3, "forgotten run, post-checkpoint dropped run, stray tmp");
    assert!(env.run_path(1).exists());
    assert!(env.run_path(2).exists(), "dropped run retained for checkpoint");
    assert!(!env.run_path(3).exists());
    assert!(!env.tmp_path(4).exists());
    assert!(!env.run_path(5).exists(), "orphaned dropped run removed");
}

/// # Scenario
/// Removing a run's files twice is harmless (absence is not an error).
#[test]
fn remove_run_files_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();
    build_run(&env, 7, 1, &[replace(b"a", b"b", 1)]);

    env.remove_run_files(7).unwrap();
    env.remove_run_files(7).unwrap();
    assert!(!env.run_path(7).exists());
}
