//! # StrataDB
//!
//! The maintenance core of an LSM-tree storage engine: the data model
//! (memtables, runs, ranges, slices) and the **background scheduler** that
//! turns sealed memory into immutable on-disk runs (dumps) and merges runs
//! to keep read amplification bounded (compactions).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Scheduler (coordinator)                  │
//! │   dump heap ── selects ──►  Dump task ──► dump worker pool    │
//! │   compact heap ─ selects ─► Compact task ► compact pool       │
//! │        ▲                        │  completions / deferred     │
//! │        └── heap updates ◄───────┘  deletes return here        │
//! │                                                               │
//! │  ┌──────────┐  ┌──────────────┐  ┌──────────┐  ┌───────────┐  │
//! │  │ LSM state │  │ Write        │  │ Run       │  │ Metadata  │ │
//! │  │ (mems,    │  │ iterator     │  │ writer /  │  │ log       │ │
//! │  │  ranges,  │  │ (merge +     │  │ reader    │  │ (atomic   │ │
//! │  │  slices)  │  │  read views) │  │           │  │  groups)  │ │
//! │  └──────────┘  └──────────────┘  └──────────┘  └───────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`scheduler`] | Coordinator loop, worker pools, priority heaps, checkpoints, throttling, deferred deletes |
//! | [`lsm`] | Per-index tree state — ranges, slices, split/coalesce, compaction priority |
//! | [`write_iterator`] | Read-view-respecting sorted merge feeding every run writer |
//! | [`run`] | Immutable on-disk runs, slices, streaming writer, mmap reader |
//! | [`memtable`] | Generation-tagged in-memory statement buffers |
//! | [`metalog`] | Transactional metadata log; replay makes on-disk state visible |
//! | [`stmt`] | Tuples, statements, keys, index definitions |
//! | [`encoding`] | Byte-stable wire format shared by the log and run files |
//!
//! ## Key guarantees
//!
//! - **Atomic visibility** — a run and its slices become real exactly when
//!   their metadata-log group commits; readers see the old or the new slice
//!   set of a range, never a mix.
//! - **Dump rounds** — a dump of generation *g* is fully visible (slices
//!   inserted, memtables freed, the dump generation advanced) before any
//!   dependent checkpoint wait returns.
//! - **Index ordering** — the primary index of a space dumps after all of
//!   its secondary indexes of the same generation (heap order + pinning).
//! - **Failure throttling** — consecutive background failures back the
//!   scheduler off exponentially (1–60 s); the next success resets it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratadb::lsm::{LsmConfig, LsmOpts};
//! use stratadb::metalog::MetaLog;
//! use stratadb::run::RunEnv;
//! use stratadb::scheduler::{NoopDeferredDeleteSink, Scheduler, SchedulerConfig};
//! use stratadb::stmt::{KeyDef, Statement};
//!
//! let env = RunEnv::new("/tmp/strata/runs").unwrap();
//! let metalog = MetaLog::open("/tmp/strata/meta", Arc::clone(&env.faults)).unwrap();
//! let sched = Scheduler::new(
//!     SchedulerConfig { write_threads: 4 },
//!     env,
//!     metalog,
//!     |generation, took| eprintln!("dumped up to {generation} in {took:?}"),
//!     Vec::new, // no open read views
//!     Arc::new(NoopDeferredDeleteSink),
//! )
//! .unwrap();
//! sched.start();
//!
//! let pk = sched.add_lsm(LsmConfig {
//!     name: "users.pk".into(),
//!     space_id: 512,
//!     index_id: 0,
//!     is_primary: true,
//!     key_def: KeyDef::new(vec![0]),
//!     primary_key_def: None,
//!     opts: LsmOpts::default(),
//! });
//!
//! sched.apply(pk, Statement::replace(vec![b"k".to_vec(), b"v".to_vec()], 1)).unwrap();
//! sched.dump().unwrap();
//! sched.shutdown();
//! ```

pub mod encoding;
pub mod fault;
pub mod lsm;
pub mod memtable;
pub mod metalog;
pub mod run;
pub mod scheduler;
pub mod stmt;
pub mod write_iterator;
