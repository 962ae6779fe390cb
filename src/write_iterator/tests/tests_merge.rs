use std::sync::Arc;

use tempfile::TempDir;

use crate::memtable::Memtable;
use crate::run::RunEnv;
use crate::run::tests::helpers::{build_run, cmp_def, replace};
use crate::run::Slice;
use crate::stmt::{KeyDef, Statement};
use crate::write_iterator::WriteIterator;

fn mem_with(r#gen: u64, cmp: &KeyDef, stmts: &[Statement]) -> Arc<Memtable> {
    let mut mem = Memtable::new(r#gen);
    for stmt in stmts {
        mem.insert(cmp.extract(&stmt.tuple), stmt.clone());
    }
    Arc::new(mem)
}

fn drain(wi: &mut WriteIterator) -> Vec<(Vec<u8>, u64, bool)> {
    let mut out = Vec::new();
    while let Some((key, stmt)) = wi.next().unwrap() {
        out.push((key.0[0].clone(), stmt.lsn, stmt.is_delete()));
    }
    out
}

/// # Scenario
/// With no read views, merging two memtables keeps only the newest
/// version per key, in key order.
#[test]
fn merge_keeps_newest_version_per_key() {
    let cmp = cmp_def();
    let newer = mem_with(1, &cmp, &[replace(b"a", b"new", 10), replace(b"c", b"x", 8)]);
    let older = mem_with(0, &cmp, &[replace(b"a", b"old", 3), replace(b"b", b"y", 5)]);

    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.add_mem(&newer);
    wi.add_mem(&older);
    wi.start().unwrap();

    assert_eq!(
        drain(&mut wi),
        vec![
            (b"a".to_vec(), 10, false),
            (b"b".to_vec(), 5, false),
            (b"c".to_vec(), 8, false),
        ]
    );
}

/// # Scenario
/// Memtable and slice sources merge into one sorted stream.
#[test]
fn memtable_and_slice_sources_merge() {
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path()).unwrap();
    let cmp = cmp_def();

    let run = build_run(&env, 1, 2, &[replace(b"b", b"disk", 2), replace(b"d", b"disk", 1)]);
    let slice = Slice::new(100, run, None, None);
    let mem = mem_with(1, &cmp, &[replace(b"a", b"ram", 5), replace(b"b", b"ram", 7)]);

    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.add_mem(&mem);
    wi.add_slice(&slice);
    wi.start().unwrap();

    assert_eq!(
        drain(&mut wi),
        vec![
            (b"a".to_vec(), 5, false),
            (b"b".to_vec(), 7, false),
            (b"d".to_vec(), 1, false),
        ]
    );
}

/// # Scenario
/// On the last level a surviving delete is dropped entirely; on any other
/// level it must be written out to keep shadowing older runs.
#[test]
fn last_level_drops_surviving_deletes() {
    let cmp = cmp_def();
    let mem = mem_with(
        0,
        &cmp,
        &[
            Statement::delete(vec![b"a".to_vec()], 9),
            replace(b"a", b"old", 2),
            replace(b"b", b"live", 5),
        ],
    );

    let mut wi = WriteIterator::new(cmp.clone(), true, true, Vec::new());
    wi.add_mem(&mem);
    wi.start().unwrap();
    assert_eq!(drain(&mut wi), vec![(b"b".to_vec(), 5, false)]);

    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.add_mem(&mem);
    wi.start().unwrap();
    assert_eq!(
        drain(&mut wi),
        vec![(b"a".to_vec(), 9, true), (b"b".to_vec(), 5, false)]
    );
}

/// # Scenario
/// The same `(key, lsn)` arriving from two sources collapses to one copy.
#[test]
fn duplicate_versions_collapse() {
    let cmp = cmp_def();
    let a = mem_with(1, &cmp, &[replace(b"k", b"v", 4)]);
    let b = mem_with(0, &cmp, &[replace(b"k", b"v", 4)]);

    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.add_mem(&a);
    wi.add_mem(&b);
    wi.start().unwrap();
    assert_eq!(drain(&mut wi), vec![(b"k".to_vec(), 4, false)]);
}
