//! Transaction Lifecycle Tests
//!
//! Tests for the transaction state machine and its bookkeeping:
//! - Legal and illegal state transitions
//! - One sub-unit per DBO and transaction
//! - Hook order on commit and rollback
//! - Lock acquisition and release
//! - Event delivery to observers

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use quarrydb::catalogue::{DatabaseError, DatabaseResult, EntityName, Name};
use quarrydb::config::{Config, ServiceConfig};
use quarrydb::execution::ManualScheduler;
use quarrydb::transaction::{
    DataChangeKind, DataPayload, Dbo, Event, ExecutionContext, LockError, LockMode, SubUnit, Transaction,
    TransactionError, TransactionId, TransactionObserver, TransactionResult, TransactionStatus, TransactionType,
};
use quarrydb::values::{Tuple, Value};
use quarrydb::Database;

// =============================================================================
// Helpers
// =============================================================================

fn quiet_config() -> Config {
    Config {
        services: ServiceConfig::disabled(),
        ..Config::default()
    }
}

fn open(config: Config) -> Database {
    Database::with_scheduler(config, ManualScheduler::new()).unwrap()
}

/// A DBO whose sub-unit records every hook it runs
struct Probe {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    veto: bool,
}

impl Probe {
    fn new(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            veto: false,
        })
    }

    fn vetoing(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            veto: true,
        })
    }
}

impl Dbo for Probe {
    type SubUnit = ProbeUnit;

    fn name(&self) -> Name {
        Name::Entity(EntityName::new("probe", self.label))
    }

    fn new_sub_unit(self: Arc<Self>, _tx: &Transaction) -> DatabaseResult<ProbeUnit> {
        Ok(ProbeUnit { probe: self })
    }
}

struct ProbeUnit {
    probe: Arc<Probe>,
}

impl ProbeUnit {
    fn record(&self, hook: &str) {
        self.probe.log.lock().push(format!("{}:{}", hook, self.probe.label));
    }
}

impl SubUnit for ProbeUnit {
    fn dbo_name(&self) -> Name {
        self.probe.name()
    }

    fn prepare_commit(&self) -> DatabaseResult<bool> {
        self.record("prepare");
        Ok(!self.probe.veto)
    }

    fn commit(&self) -> DatabaseResult<()> {
        self.record("commit");
        Ok(())
    }

    fn abort(&self) -> DatabaseResult<()> {
        self.record("abort");
        Ok(())
    }

    fn finalize(&self, committed: bool) {
        self.record(if committed { "finalize+" } else { "finalize-" });
    }
}

/// Observer interested in column staleness only
#[derive(Default)]
struct Recorder {
    commits: Mutex<Vec<(TransactionId, usize)>>,
    failures: Mutex<Vec<TransactionId>>,
}

impl TransactionObserver for Recorder {
    fn is_relevant(&self, event: &Event) -> bool {
        matches!(event, Event::ColumnStale { .. })
    }

    fn on_commit(&self, tx: TransactionId, events: &[Event]) {
        self.commits.lock().push((tx, events.len()));
    }

    fn on_delivery_failure(&self, tx: TransactionId) {
        self.failures.lock().push(tx);
    }
}

fn stale_event() -> Event {
    Event::ColumnStale {
        column: EntityName::new("s", "e").column("c"),
    }
}

fn data_event() -> Event {
    Event::DataChanged {
        entity: EntityName::new("s", "e"),
        kind: DataChangeKind::Insert,
        payload: DataPayload {
            tuple_id: 1,
            changes: vec![],
        },
    }
}

fn probe_name(label: &str) -> Name {
    Name::Entity(EntityName::new("probe", label))
}

// =============================================================================
// State Machine Tests
// =============================================================================

/// A new transaction is idle and commits into the terminal commit state.
#[test]
fn test_commit_from_idle() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    assert_eq!(tx.state(), TransactionStatus::Idle);

    tx.commit().unwrap();
    assert_eq!(tx.state(), TransactionStatus::Commit);
    assert!(tx.metadata().ended.is_some());
}

/// Terminal transactions reject every further transition.
#[test]
fn test_terminal_states_reject_transitions() {
    let db = open(quiet_config());

    let committed = db.begin(TransactionType::UserExclusive).unwrap();
    committed.commit().unwrap();
    assert!(matches!(committed.commit(), Err(TransactionError::IllegalState { .. })));
    assert!(matches!(committed.rollback(), Err(TransactionError::IllegalState { .. })));
    assert!(matches!(committed.kill(), Err(TransactionError::IllegalState { .. })));

    let rolled_back = db.begin(TransactionType::UserReadonly).unwrap();
    rolled_back.rollback().unwrap();
    assert_eq!(rolled_back.state(), TransactionStatus::Rollback);
    let err = rolled_back.commit().unwrap_err();
    assert_eq!(err.code(), "QDB_TX_ILLEGAL_STATE");
}

/// A failed execution leaves the transaction in error: commit is refused,
/// rollback is allowed.
#[test]
fn test_error_state_only_rolls_back() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserExclusive).unwrap();

    let execution = tx
        .execute(|_ctx: &ExecutionContext| -> TransactionResult<Option<Vec<Tuple>>> {
            Err(TransactionError::execution("boom"))
        })
        .unwrap();
    assert!(execution.finish().is_err());
    assert_eq!(tx.state(), TransactionStatus::Error);
    assert_eq!(tx.metadata().error, 1);

    assert!(matches!(tx.commit(), Err(TransactionError::IllegalState { .. })));
    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionStatus::Rollback);
}

/// An implicit transaction commits itself once its statement succeeds.
#[test]
fn test_implicit_transaction_commits_after_execution() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserImplicitReadonly).unwrap();

    let mut batches = vec![
        vec![Tuple::new(2, vec![Some(Value::Int(2))])],
        vec![Tuple::new(1, vec![Some(Value::Int(1))])],
    ];
    let rows = tx
        .execute(move |_ctx: &ExecutionContext| -> TransactionResult<Option<Vec<Tuple>>> { Ok(batches.pop()) })
        .unwrap()
        .collect()
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].tuple_id, 1);
    assert_eq!(tx.state(), TransactionStatus::Commit);
    assert_eq!(tx.metadata().success, 1);
}

/// Kill cancels a running pipeline at its next batch boundary.
#[test]
fn test_kill_cancels_running_pipeline() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserExclusive).unwrap();

    let execution = tx
        .execute(|_ctx: &ExecutionContext| -> TransactionResult<Option<Vec<Tuple>>> {
            thread::sleep(Duration::from_millis(1));
            Ok(Some(Vec::new()))
        })
        .unwrap();
    assert_eq!(tx.state(), TransactionStatus::Running);

    tx.kill().unwrap();
    assert_eq!(tx.state(), TransactionStatus::Rollback);
    assert_eq!(tx.ongoing(), 0);
    assert!(matches!(execution.finish(), Err(TransactionError::Cancelled(_))));
    assert_eq!(db.metrics().killed(), 1);
}

/// Commit is refused while a pipeline is running.
#[test]
fn test_commit_refused_while_running() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);

    let execution = tx
        .execute(move |_ctx: &ExecutionContext| -> TransactionResult<Option<Vec<Tuple>>> {
            let _ = gate.lock().recv();
            Ok(None)
        })
        .unwrap();
    assert!(matches!(tx.commit(), Err(TransactionError::IllegalState { .. })));

    release.send(()).unwrap();
    assert_eq!(execution.finish().unwrap(), 0);
    assert_eq!(tx.state(), TransactionStatus::Idle);
    tx.commit().unwrap();
}

// =============================================================================
// Sub-unit Tests
// =============================================================================

/// Concurrent requests for the same DBO's sub-unit observe one instance.
#[test]
fn test_exactly_one_sub_unit_per_dbo() {
    let db = open(quiet_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let probe = Probe::new("a", &log);
    let tx = db.begin(TransactionType::UserExclusive).unwrap();

    let first = tx.get_or_create_sub_unit(&probe).unwrap();
    let units: Vec<Arc<ProbeUnit>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| tx.get_or_create_sub_unit(&probe).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for unit in &units {
        assert!(Arc::ptr_eq(unit, &first));
    }
    assert_eq!(tx.touched(), vec![probe_name("a")]);
    tx.commit().unwrap();
}

/// Sub-units cannot be created once the transaction has ended.
#[test]
fn test_no_sub_units_after_finalize() {
    let db = open(quiet_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let probe = Probe::new("a", &log);
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    tx.commit().unwrap();

    let err = tx.get_or_create_sub_unit(&probe).err().unwrap();
    assert!(matches!(err, DatabaseError::TransactionClosed(_)));
}

/// Commit runs prepare, commit and finalize hooks in reverse creation order.
#[test]
fn test_commit_hooks_run_in_reverse_order() {
    let db = open(quiet_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    for probe in [Probe::new("a", &log), Probe::new("b", &log), Probe::new("c", &log)] {
        tx.get_or_create_sub_unit(&probe).unwrap();
    }

    tx.commit().unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "prepare:c", "prepare:b", "prepare:a", "commit:c", "commit:b", "commit:a", "finalize+:c",
            "finalize+:b", "finalize+:a",
        ]
    );
}

/// Rollback runs abort and finalize hooks in reverse creation order.
#[test]
fn test_rollback_hooks_run_in_reverse_order() {
    let db = open(quiet_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    for probe in [Probe::new("a", &log), Probe::new("b", &log)] {
        tx.get_or_create_sub_unit(&probe).unwrap();
    }

    tx.rollback().unwrap();
    assert_eq!(*log.lock(), vec!["abort:b", "abort:a", "finalize-:b", "finalize-:a"]);
}

/// A veto aborts the commit; every sub-unit is aborted and finalized.
#[test]
fn test_veto_aborts_commit() {
    let db = open(quiet_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    for probe in [Probe::new("a", &log), Probe::vetoing("b", &log), Probe::new("c", &log)] {
        tx.get_or_create_sub_unit(&probe).unwrap();
    }

    let err = tx.commit().unwrap_err();
    match err {
        TransactionError::CommitVetoed { object, .. } => assert_eq!(object, probe_name("b")),
        other => panic!("expected veto, got {:?}", other),
    }
    assert_eq!(tx.state(), TransactionStatus::Rollback);
    assert_eq!(
        *log.lock(),
        vec![
            "prepare:c", "prepare:b", "abort:c", "abort:b", "abort:a", "finalize-:c", "finalize-:b",
            "finalize-:a",
        ]
    );
}

// =============================================================================
// Lock Tests
// =============================================================================

/// Every lock acquired by a transaction is released when it ends.
#[test]
fn test_locks_released_on_commit_and_rollback() {
    let db = open(quiet_config());
    let table = db.transactions().lock_table();
    let (a, b) = (probe_name("a"), probe_name("b"));

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    tx.request_lock(&a, LockMode::Exclusive).unwrap();
    tx.request_lock(&b, LockMode::Shared).unwrap();
    assert_eq!(table.mode_of(tx.id(), &a), Some(LockMode::Exclusive));
    assert_eq!(table.held_by(tx.id()).len(), 2);
    tx.commit().unwrap();
    assert!(!table.is_locked(&a));
    assert!(!table.is_locked(&b));
    assert_eq!(tx.metadata().locks_released, 2);

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    tx.request_lock(&a, LockMode::Exclusive).unwrap();
    tx.rollback().unwrap();
    assert_eq!(table.locked_objects(), 0);
}

/// A waiting transaction is granted its lock once the holder commits.
#[test]
fn test_waiter_granted_after_holder_ends() {
    let db = open(quiet_config());
    let name = probe_name("a");
    let holder = db.begin(TransactionType::UserExclusive).unwrap();
    holder.request_lock(&name, LockMode::Exclusive).unwrap();

    let waiter = db.begin(TransactionType::UserExclusive).unwrap();
    let (granted, wait) = mpsc::channel();
    let handle = {
        let waiter = waiter.clone();
        let name = name.clone();
        thread::spawn(move || {
            waiter.request_lock(&name, LockMode::Shared).unwrap();
            granted.send(()).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(wait.try_recv().is_err());

    holder.commit().unwrap();
    wait.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
    assert_eq!(
        db.transactions().lock_table().mode_of(waiter.id(), &name),
        Some(LockMode::Shared)
    );
    waiter.rollback().unwrap();
}

/// With a lock timeout, a blocked request fails instead of waiting forever.
#[test]
fn test_lock_timeout() {
    let mut config = quiet_config();
    config.execution.lock_timeout_ms = Some(30);
    let db = open(config);
    let name = probe_name("a");

    let holder = db.begin(TransactionType::UserExclusive).unwrap();
    holder.request_lock(&name, LockMode::Exclusive).unwrap();
    let other = db.begin(TransactionType::UserExclusive).unwrap();

    let err = other.request_lock(&name, LockMode::Shared).unwrap_err();
    assert!(matches!(err, DatabaseError::Lock(LockError::Timeout { .. })));
    assert_eq!(err.code(), "QDB_LOCK_TIMEOUT");

    holder.commit().unwrap();
    other.request_lock(&name, LockMode::Shared).unwrap();
    other.commit().unwrap();
}

/// Read-only transactions take no grants and cannot lock exclusively.
#[test]
fn test_read_only_locking() {
    let db = open(quiet_config());
    let name = probe_name("a");
    let tx = db.begin(TransactionType::UserReadonly).unwrap();

    tx.request_lock(&name, LockMode::Shared).unwrap();
    assert!(!db.transactions().lock_table().is_locked(&name));

    let err = tx.request_lock(&name, LockMode::Exclusive).unwrap_err();
    assert!(matches!(err, DatabaseError::Lock(LockError::ReadOnly { .. })));
    tx.commit().unwrap();
}

// =============================================================================
// Event Delivery Tests
// =============================================================================

/// A commit without events reaches every observer; a commit carrying only
/// irrelevant events reaches none.
#[test]
fn test_empty_log_reaches_every_observer() {
    let db = open(quiet_config());
    let recorder = Arc::new(Recorder::default());
    db.transactions()
        .register_observer(Arc::clone(&recorder) as Arc<dyn TransactionObserver>);

    let empty = db.begin(TransactionType::UserExclusive).unwrap();
    empty.commit().unwrap();

    let irrelevant = db.begin(TransactionType::UserExclusive).unwrap();
    irrelevant.signal_event(data_event());
    irrelevant.commit().unwrap();

    let relevant = db.begin(TransactionType::UserExclusive).unwrap();
    relevant.signal_event(data_event());
    relevant.signal_event(stale_event());
    relevant.commit().unwrap();

    assert_eq!(*recorder.commits.lock(), vec![(empty.id(), 0), (relevant.id(), 2)]);
    assert!(recorder.failures.lock().is_empty());
}

/// Logs are delivered in commit order, not in begin order.
#[test]
fn test_delivery_follows_commit_order() {
    let db = open(quiet_config());
    let recorder = Arc::new(Recorder::default());
    db.transactions()
        .register_observer(Arc::clone(&recorder) as Arc<dyn TransactionObserver>);

    let first = db.begin(TransactionType::UserExclusive).unwrap();
    let second = db.begin(TransactionType::UserExclusive).unwrap();
    first.signal_event(stale_event());
    second.signal_event(stale_event());
    second.commit().unwrap();
    first.commit().unwrap();

    let order: Vec<_> = recorder.commits.lock().iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![second.id(), first.id()]);
}

/// A failed commit carrying relevant events is reported as a delivery
/// failure; rolled back transactions report nothing.
#[test]
fn test_failed_commit_reports_delivery_failure() {
    let db = open(quiet_config());
    let recorder = Arc::new(Recorder::default());
    db.transactions()
        .register_observer(Arc::clone(&recorder) as Arc<dyn TransactionObserver>);
    let log = Arc::new(Mutex::new(Vec::new()));

    let vetoed = db.begin(TransactionType::UserExclusive).unwrap();
    vetoed.get_or_create_sub_unit(&Probe::vetoing("a", &log)).unwrap();
    vetoed.signal_event(stale_event());
    assert!(vetoed.commit().is_err());

    let rolled_back = db.begin(TransactionType::UserExclusive).unwrap();
    rolled_back.signal_event(stale_event());
    rolled_back.rollback().unwrap();

    assert!(recorder.commits.lock().is_empty());
    assert_eq!(*recorder.failures.lock(), vec![vetoed.id()]);
}

/// An event log beyond the staging limit is dropped and reported as a
/// delivery failure to every observer.
#[test]
fn test_overflowed_log_is_a_delivery_failure() {
    let mut config = quiet_config();
    config.execution.max_staged_events = 2;
    let db = open(config);
    let recorder = Arc::new(Recorder::default());
    db.transactions()
        .register_observer(Arc::clone(&recorder) as Arc<dyn TransactionObserver>);

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    for _ in 0..3 {
        tx.signal_event(data_event());
    }
    assert_eq!(tx.staged_events(), 0);
    tx.commit().unwrap();

    assert!(recorder.commits.lock().is_empty());
    assert_eq!(*recorder.failures.lock(), vec![tx.id()]);
    assert_eq!(db.metrics().delivery_failures(), 1);
}

/// Deregistered observers receive nothing further.
#[test]
fn test_deregistered_observer_is_silent() {
    let db = open(quiet_config());
    let recorder = Arc::new(Recorder::default());
    let observer = Arc::clone(&recorder) as Arc<dyn TransactionObserver>;
    let manager = db.transactions();
    let before = manager.observer_count();

    manager.register_observer(Arc::clone(&observer));
    assert_eq!(manager.observer_count(), before + 1);
    assert!(manager.deregister_observer(&observer));
    assert!(!manager.deregister_observer(&observer));

    db.begin(TransactionType::UserExclusive).unwrap().commit().unwrap();
    assert!(recorder.commits.lock().is_empty());
}

// =============================================================================
// Conflict and Bookkeeping Tests
// =============================================================================

/// Two writers of the same key: the second commit is in conflict.
#[test]
fn test_write_write_conflict() {
    let db = open(quiet_config());
    let put = |tx: &Transaction, value: &[u8]| {
        tx.with_storage(|s| Ok(s.put("test.data", b"key".to_vec(), value.to_vec())?))
            .unwrap()
    };

    let first = db.begin(TransactionType::UserExclusive).unwrap();
    let second = db.begin(TransactionType::UserExclusive).unwrap();
    put(&first, b"1");
    put(&second, b"2");

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, TransactionError::InConflict(id) if id == second.id()));
    assert_eq!(second.state(), TransactionStatus::Rollback);
    assert_eq!(db.metrics().conflicts(), 1);

    let reader = db.begin(TransactionType::UserReadonly).unwrap();
    let value = reader.with_storage(|s| Ok(s.get("test.data", b"key")?)).unwrap();
    assert_eq!(value, Some(b"1".to_vec()));
}

/// Live transactions are tracked until they end; history keeps them.
#[test]
fn test_live_and_history() {
    let db = open(quiet_config());
    let manager = db.transactions();

    let a = db.begin(TransactionType::UserExclusive).unwrap();
    let b = db.begin(TransactionType::UserReadonly).unwrap();
    assert!(a.id() < b.id());
    assert_eq!(manager.live().len(), 2);
    assert!(manager.lookup(a.id()).is_some());

    a.commit().unwrap();
    assert!(manager.lookup(a.id()).is_none());
    assert_eq!(manager.live().len(), 1);

    let history = manager.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].state, TransactionStatus::Commit);
    assert_eq!(history[1].state, TransactionStatus::Idle);
}

/// Shutdown kills whatever is still live.
#[test]
fn test_shutdown_kills_live_transactions() {
    let db = open(quiet_config());
    let tx = db.begin(TransactionType::UserExclusive).unwrap();

    db.shutdown();
    assert_eq!(tx.state(), TransactionStatus::Rollback);
    assert!(db.transactions().live().is_empty());
}
