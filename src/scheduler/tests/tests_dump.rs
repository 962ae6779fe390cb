use std::time::Duration;

use super::helpers::*;

/// # Scenario
/// Two generations of data dumped one round apart.
///
/// # Expected behavior
/// Two runs on disk, each contributing one slice to the single range;
/// `dump_generation` reaches 2; no sealed memtable remains.
#[test]
fn two_rounds_produce_two_runs() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched.apply(lsm, row("a", "1", 1)).unwrap();
    h.sched.apply(lsm, row("b", "2", 2)).unwrap();
    h.sched.dump().unwrap();

    h.sched.apply(lsm, row("c", "3", 3)).unwrap();
    h.sched.dump().unwrap();

    let stats = h.sched.stats();
    assert_eq!(stats.dump_generation, 2);
    assert_eq!(stats.generation, 2);

    let info = h.sched.lsm_info(lsm).unwrap();
    assert_eq!(info.run_count, 2);
    assert_eq!(info.sealed_count, 0, "no memtable at or below dump generation");
    assert_eq!(info.ranges.len(), 1);
    assert_eq!(info.ranges[0].slice_count, 2);
    assert_eq!(info.dump_lsn, 3);
    assert_eq!(run_files(&h), 2);
}

/// # Scenario
/// A dump round with no data at all.
///
/// # Expected behavior
/// The round completes (generation advances, callback fires) without
/// creating any run.
#[test]
fn empty_round_still_progresses() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched.dump().unwrap();

    let stats = h.sched.stats();
    assert_eq!(stats.dump_generation, 1);
    assert_eq!(h.sched.lsm_info(lsm).unwrap().run_count, 0);
    assert_eq!(run_files(&h), 0);
    let rounds = h.rounds.lock().unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].0, 0, "callback reports min_generation - 1");
}

/// # Scenario
/// A memtable holding only a delete with nothing older to shadow.
///
/// # Expected behavior
/// The merge annihilates everything: the prepared run is discarded, the
/// memtable is still freed, and the round still progresses.
#[test]
fn all_deletes_dump_discards_empty_run() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched
        .apply(lsm, crate::stmt::Statement::delete(vec![b"ghost".to_vec()], 5))
        .unwrap();
    h.sched.dump().unwrap();

    let info = h.sched.lsm_info(lsm).unwrap();
    assert_eq!(info.run_count, 0);
    assert_eq!(info.sealed_count, 0);
    assert_eq!(info.dump_lsn, 5, "dump LSN advances even for an empty run");
    assert_eq!(run_files(&h), 0);
    assert_eq!(h.sched.stats().dump_generation, 1);
}

/// # Scenario
/// `trigger_dump` called repeatedly while a round is in progress.
///
/// # Expected behavior
/// Idempotent: the generation is bumped exactly once.
#[test]
fn trigger_is_idempotent_during_round() {
    let h = harness();
    let _lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched.trigger_dump();
    let after_first = h.sched.stats().generation;
    h.sched.trigger_dump();
    h.sched.trigger_dump();
    assert_eq!(h.sched.stats().generation, after_first);

    assert!(poll_until(&h.sched, Duration::from_secs(5), |s| {
        s.dump_generation == s.generation
    }));
}

/// # Scenario
/// The same rows read back identically before and after a dump.
///
/// # Expected behavior
/// Dumping moves data between layers without changing what reads see.
#[test]
fn dump_preserves_visible_rows() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    for i in 0..50u64 {
        h.sched
            .apply(lsm, row(&format!("k{i:03}"), &format!("v{i}"), i + 1))
            .unwrap();
    }
    h.sched
        .apply(lsm, crate::stmt::Statement::delete(vec![b"k007".to_vec()], 100))
        .unwrap();

    let before = h.sched.visible_rows(lsm).unwrap();
    assert_eq!(before.len(), 49);
    h.sched.dump().unwrap();
    let after = h.sched.visible_rows(lsm).unwrap();
    assert_eq!(before, after);
}

/// # Scenario
/// Keys applied in random order.
///
/// # Expected behavior
/// The dump produces one sorted run whose key bounds span the whole set,
/// and reads come back in key order regardless of insertion order.
#[test]
fn dump_sorts_random_insertion_order() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    let keys = shuffled_keys(64);
    for (i, key) in keys.iter().enumerate() {
        h.sched.apply(lsm, row(key, "v", i as u64 + 1)).unwrap();
    }
    h.sched.dump().unwrap();

    let info = h.sched.lsm_info(lsm).unwrap();
    let run_id = info.ranges[0].run_ids[0];
    let run = crate::run::Run::open(h.sched.env(), run_id, 64).unwrap();
    assert_eq!(run.info.stmt_count, 64);
    assert_eq!(run.info.min_key.as_ref().unwrap().0[0], b"k00000".to_vec());
    assert_eq!(run.info.max_key.as_ref().unwrap().0[0], b"k00063".to_vec());

    let rows = h.sched.visible_rows(lsm).unwrap();
    let read_keys: Vec<Vec<u8>> = rows.iter().map(|(_, t)| t.fields[0].clone()).collect();
    let mut sorted = read_keys.clone();
    sorted.sort();
    assert_eq!(read_keys.len(), 64);
    assert_eq!(read_keys, sorted);
}

/// # Scenario
/// The round-completion callback reports `min_generation - 1` and a
/// measured duration per round.
#[test]
fn dump_complete_callback_reports_rounds() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched.apply(lsm, row("a", "1", 1)).unwrap();
    h.sched.dump().unwrap();
    h.sched.apply(lsm, row("b", "2", 2)).unwrap();
    h.sched.dump().unwrap();

    let rounds = h.rounds.lock().unwrap();
    let generations: Vec<u64> = rounds.iter().map(|(g, _)| *g).collect();
    assert_eq!(generations, vec![0, 1]);
}

/// # Scenario
/// An open read view straddles two versions of one key when the dump
/// runs.
///
/// # Expected behavior
/// The dumped run keeps both versions — the snapshot must still see the
/// older one.
#[test]
fn read_views_preserve_shadowed_versions() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    h.sched.apply(lsm, row("k", "v1", 1)).unwrap();
    h.sched.apply(lsm, row("k", "v2", 5)).unwrap();
    *h.views.lock().unwrap() = vec![3];
    h.sched.dump().unwrap();

    let info = h.sched.lsm_info(lsm).unwrap();
    let run_id = info.ranges[0].run_ids[0];
    let run = crate::run::Run::open(h.sched.env(), run_id, 5).unwrap();
    assert_eq!(run.info.stmt_count, 2, "snapshot keeps the shadowed version");
    assert_eq!(run.info.min_lsn, 1);
    assert_eq!(run.info.max_lsn, 5);
}

/// # Scenario
/// The scheduler state invariant `dump_generation ≤ tree generation ≤
/// generation` holds at every quiescent point.
#[test]
fn generation_window_invariant_holds() {
    let h = harness();
    let lsm = h.sched.add_lsm(primary_config("t.pk", 512, calm_opts()));

    for round in 0..3u64 {
        h.sched
            .apply(lsm, row(&format!("r{round}"), "v", round * 10 + 1))
            .unwrap();
        h.sched.dump().unwrap();
        let stats = h.sched.stats();
        let info = h.sched.lsm_info(lsm).unwrap();
        assert!(stats.dump_generation <= info.generation);
        assert!(info.generation <= stats.generation);
    }
}
