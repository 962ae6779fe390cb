use std::sync::{Arc, Mutex};

use crate::memtable::Memtable;
use crate::run::tests::helpers::{cmp_def, replace};
use crate::stmt::{KeyDef, Statement};
use crate::write_iterator::{DeferredDeleteHandler, WriteIterator};

/// Test handler capturing `(old_lsn, new_lsn)` pairs.
struct Recorder(Arc<Mutex<Vec<(u64, u64)>>>);

impl DeferredDeleteHandler for Recorder {
    fn process(
        &mut self,
        old: &Statement,
        new: &Statement,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.lock().unwrap().push((old.lsn, new.lsn));
        Ok(())
    }
}

fn mem_with(cmp: &KeyDef, stmts: &[Statement]) -> Arc<Memtable> {
    let mut mem = Memtable::new(0);
    for stmt in stmts {
        mem.insert(cmp.extract(&stmt.tuple), stmt.clone());
    }
    Arc::new(mem)
}

/// # Scenario
/// A `Replace` shadowed by a newer `Replace` emits exactly one overwrite
/// pair carrying the shadowing statement's LSN.
#[test]
fn overwritten_replace_emits_one_pair() {
    let cmp = cmp_def();
    let mem = mem_with(&cmp, &[replace(b"a", b"old", 7), replace(b"a", b"new", 42)]);

    let pairs = Arc::new(Mutex::new(Vec::new()));
    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.set_deferred_handler(Box::new(Recorder(Arc::clone(&pairs))));
    wi.add_mem(&mem);
    wi.start().unwrap();
    while wi.next().unwrap().is_some() {}

    assert_eq!(*pairs.lock().unwrap(), vec![(7, 42)]);
}

/// # Scenario
/// A `Replace` shadowed by a delete emits a pair even when the last-level
/// rule then drops the delete itself — the secondary indexes still need
/// the propagation.
#[test]
fn delete_shadowing_replace_emits_pair_at_last_level() {
    let cmp = cmp_def();
    let mem = mem_with(
        &cmp,
        &[
            replace(b"a", b"doomed", 7),
            Statement::delete(vec![b"a".to_vec()], 42),
        ],
    );

    let pairs = Arc::new(Mutex::new(Vec::new()));
    let mut wi = WriteIterator::new(cmp, true, true, Vec::new());
    wi.set_deferred_handler(Box::new(Recorder(Arc::clone(&pairs))));
    wi.add_mem(&mem);
    wi.start().unwrap();
    let mut out = Vec::new();
    while let Some((_, stmt)) = wi.next().unwrap() {
        out.push(stmt.lsn);
    }

    assert_eq!(out, Vec::<u64>::new(), "delete eliminated at last level");
    assert_eq!(*pairs.lock().unwrap(), vec![(7, 42)]);
}

/// # Scenario
/// Shadowed deletes never emit pairs, and kept versions never do either.
#[test]
fn only_dropped_replaces_emit_pairs() {
    let cmp = cmp_def();
    let mem = mem_with(
        &cmp,
        &[
            Statement::delete(vec![b"a".to_vec()], 3),
            replace(b"a", b"mid", 5),
            replace(b"a", b"top", 9),
        ],
    );

    let pairs = Arc::new(Mutex::new(Vec::new()));
    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.set_deferred_handler(Box::new(Recorder(Arc::clone(&pairs))));
    wi.add_mem(&mem);
    wi.start().unwrap();
    while wi.next().unwrap().is_some() {}

    // The delete at 3 is dropped but is not a Replace; the Replace at 5
    // is dropped and shadowed by 9.
    assert_eq!(*pairs.lock().unwrap(), vec![(5, 9)]);
}

/// # Scenario
/// Without a handler no pairs are recorded and filtering is unchanged.
#[test]
fn no_handler_means_no_emission() {
    let cmp = cmp_def();
    let mem = mem_with(&cmp, &[replace(b"a", b"old", 1), replace(b"a", b"new", 2)]);

    let mut wi = WriteIterator::new(cmp, true, false, Vec::new());
    wi.add_mem(&mem);
    wi.start().unwrap();
    let mut lsns = Vec::new();
    while let Some((_, stmt)) = wi.next().unwrap() {
        lsns.push(stmt.lsn);
    }
    assert_eq!(lsns, vec![2]);
}
