use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::fault::FaultInjector;
use crate::lsm::{LsmConfig, LsmOpts};
use crate::metalog::MetaLog;
use crate::run::RunEnv;
use crate::scheduler::{DeferredDeleteSink, Scheduler, SchedulerConfig};
use crate::stmt::{KeyDef, Statement, Tuple};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly —
/// only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sink recording every routed deferred-delete row. Can be armed to fail,
/// and gated so a test can hold the coordinator mid-route.
pub struct TestSink {
    pub calls: Mutex<Vec<(u32, u64, Tuple)>>,
    pub fail: AtomicBool,
    gate_closed: Mutex<bool>,
    gate: Condvar,
}

impl TestSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate_closed: Mutex::new(false),
            gate: Condvar::new(),
        })
    }

    /// Makes the next `apply` calls block until [`TestSink::open_gate`].
    pub fn close_gate(&self) {
        *self.gate_closed.lock().unwrap() = true;
    }

    pub fn open_gate(&self) {
        *self.gate_closed.lock().unwrap() = false;
        self.gate.notify_all();
    }

    pub fn rows(&self) -> Vec<(u32, u64, Tuple)> {
        self.calls.lock().unwrap().clone()
    }
}

impl DeferredDeleteSink for TestSink {
    fn apply(
        &self,
        space_id: u32,
        deletes: &[(u64, Tuple)],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut closed = self.gate_closed.lock().unwrap();
            while *closed {
                closed = self.gate.wait(closed).unwrap();
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("secondary index constraint violation".into());
        }
        let mut calls = self.calls.lock().unwrap();
        for (lsn, tuple) in deletes {
            calls.push((space_id, *lsn, tuple.clone()));
        }
        Ok(())
    }
}

/// Everything a scheduler test needs, rooted in one temp directory.
/// Field order matters: the scheduler must shut down before the
/// directory is removed.
pub struct TestHarness {
    pub sched: Scheduler,
    pub dir: TempDir,
    pub sink: Arc<TestSink>,
    /// `(generation, duration)` per completed dump round.
    pub rounds: Arc<Mutex<Vec<(u64, Duration)>>>,
    /// Read-view LSNs handed to new tasks.
    pub views: Arc<Mutex<Vec<u64>>>,
    pub faults: Arc<FaultInjector>,
}

/// Builds and starts a scheduler over a fresh temp directory.
pub fn harness() -> TestHarness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let env = RunEnv::new(dir.path().join("runs")).unwrap();
    let faults = Arc::clone(&env.faults);
    let metalog = MetaLog::open(dir.path().join("meta"), Arc::clone(&faults)).unwrap();

    let sink = TestSink::new();
    let rounds: Arc<Mutex<Vec<(u64, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
    let views: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let rounds_cb = Arc::clone(&rounds);
    let views_cb = Arc::clone(&views);
    let sink_param: Arc<dyn DeferredDeleteSink> = sink.clone();
    let sched = Scheduler::new(
        SchedulerConfig { write_threads: 4 },
        env,
        metalog,
        move |generation, took| rounds_cb.lock().unwrap().push((generation, took)),
        move || views_cb.lock().unwrap().clone(),
        sink_param,
    )
    .unwrap();
    sched.start();

    TestHarness {
        sched,
        dir,
        sink,
        rounds,
        views,
        faults,
    }
}

/// Tree options sized for tests: tiny pages, no auto-compaction.
pub fn calm_opts() -> LsmOpts {
    LsmOpts {
        bloom_fpr: 0.05,
        page_size: 256,
        run_count_per_level: 8,
        range_size: u64::MAX,
    }
}

/// Tree options that auto-compact as soon as two similar runs exist.
pub fn eager_opts() -> LsmOpts {
    LsmOpts {
        run_count_per_level: 1,
        ..calm_opts()
    }
}

pub fn primary_config(name: &str, space_id: u32, opts: LsmOpts) -> LsmConfig {
    LsmConfig {
        name: name.into(),
        space_id,
        index_id: 0,
        is_primary: true,
        key_def: KeyDef::new(vec![0]),
        primary_key_def: None,
        opts,
    }
}

pub fn secondary_config(name: &str, space_id: u32, opts: LsmOpts) -> LsmConfig {
    LsmConfig {
        name: name.into(),
        space_id,
        index_id: 1,
        is_primary: false,
        key_def: KeyDef::new(vec![1]),
        primary_key_def: Some(KeyDef::new(vec![0])),
        opts,
    }
}

/// A two-field row statement: `(key, value)` at `lsn`.
pub fn row(key: &str, value: &str, lsn: u64) -> Statement {
    Statement::replace(vec![key.as_bytes().to_vec(), value.as_bytes().to_vec()], lsn)
}

/// `count` distinct row keys in random insertion order.
pub fn shuffled_keys(count: usize) -> Vec<String> {
    use rand::seq::SliceRandom;
    let mut keys: Vec<String> = (0..count).map(|i| format!("k{i:05}")).collect();
    keys.shuffle(&mut rand::rng());
    keys
}

/// Polls `stats()` until `pred` holds or the timeout expires.
pub fn poll_until(
    sched: &Scheduler,
    timeout: Duration,
    pred: impl Fn(&crate::scheduler::SchedulerStats) -> bool,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if pred(&sched.stats()) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Committed `.run` files currently on disk.
pub fn run_files(h: &TestHarness) -> usize {
    std::fs::read_dir(h.dir.path().join("runs"))
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .to_string_lossy()
                .ends_with(".run")
        })
        .count()
}
