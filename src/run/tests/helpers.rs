use std::sync::Arc;

use crate::run::{Run, RunEnv, writer::RunWriter};
use crate::stmt::{Key, KeyDef, Statement};

/// Key definition used throughout run tests: first field is the key.
pub(crate) fn cmp_def() -> KeyDef {
    KeyDef::new(vec![0])
}

/// Sorts statements into `(key ASC, LSN DESC)` merge order.
pub(crate) fn sort_for_run(cmp: &KeyDef, stmts: &[Statement]) -> Vec<(Key, Statement)> {
    let mut items: Vec<(Key, Statement)> = stmts
        .iter()
        .map(|s| (cmp.extract(&s.tuple), s.clone()))
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.lsn.cmp(&a.1.lsn)));
    items
}

/// Writes and opens a committed run holding `stmts`.
pub(crate) fn build_run(env: &RunEnv, id: u64, dump_lsn: u64, stmts: &[Statement]) -> Arc<Run> {
    let cmp = cmp_def();
    let mut writer = RunWriter::create(env, id, 0.01, 512).unwrap();
    for (key, stmt) in sort_for_run(&cmp, stmts) {
        writer.append(&key, stmt).unwrap();
    }
    writer.commit().unwrap();
    Arc::new(Run::open(env, id, dump_lsn).unwrap())
}

/// A `Replace` of `(key, value)` at `lsn`.
pub(crate) fn replace(key: &[u8], value: &[u8], lsn: u64) -> Statement {
    Statement::replace(vec![key.to_vec(), value.to_vec()], lsn)
}
