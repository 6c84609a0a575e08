//! Statistics Service Tests
//!
//! Tests for the services that keep statistics current:
//! - Auto-analyzer reacting to stale columns
//! - Analyses racing concurrent writers
//! - Change tracker recomputing entity statistics
//! - Persister writing the statistics buffer
//! - Statistics surviving a reopen

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quarrydb::catalogue::{ColumnDef, EntityName, EntitySubUnit, SchemaName};
use quarrydb::config::{Config, ServiceConfig};
use quarrydb::execution::{ManualScheduler, Scheduler};
use quarrydb::fail_point::points;
use quarrydb::services::PersistOutcome;
use quarrydb::statistics::ColumnMetrics;
use quarrydb::storage::Environment;
use quarrydb::transaction::{Transaction, TransactionType};
use quarrydb::values::{Type, Value};
use quarrydb::Database;

// =============================================================================
// Helpers
// =============================================================================

fn config(services: ServiceConfig) -> Config {
    Config {
        services,
        ..Config::default()
    }
}

fn open(config: Config) -> (Database, Arc<ManualScheduler>) {
    let scheduler = ManualScheduler::new();
    let db = Database::with_scheduler(config, Arc::clone(&scheduler) as Arc<dyn Scheduler>).unwrap();
    (db, scheduler)
}

fn only(enable: impl FnOnce(&mut ServiceConfig)) -> ServiceConfig {
    let mut services = ServiceConfig::disabled();
    enable(&mut services);
    services
}

/// Create `s.<entity>(id INT, label STRING NULL)`
fn create_entity(db: &Database, entity: &str) -> EntityName {
    let schema_name = SchemaName::new("s");
    let name = schema_name.entity(entity);
    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let catalogue_su = tx.get_or_create_sub_unit(db.catalogue()).unwrap();
    let schema = match catalogue_su.schema_for_name(&schema_name) {
        Ok(schema) => schema,
        Err(_) => catalogue_su.create_schema(&schema_name).unwrap(),
    };
    tx.get_or_create_sub_unit(&schema)
        .unwrap()
        .create_entity(
            &name,
            vec![
                ColumnDef::new("id", Type::Int),
                ColumnDef::new("label", Type::String).nullable(),
            ],
        )
        .unwrap();
    tx.commit().unwrap();
    name
}

fn entity_su(db: &Database, tx: &Transaction, name: &EntityName) -> Arc<EntitySubUnit> {
    let entity = db.catalogue().resolve_entity(tx, name).unwrap();
    tx.get_or_create_sub_unit(&entity).unwrap()
}

/// Insert one row per id, each in its own transaction
fn insert_rows(db: &Database, name: &EntityName, ids: &[i32]) {
    for id in ids {
        let tx = db.begin(TransactionType::UserExclusive).unwrap();
        let label = (id % 2 == 0).then(|| Value::String(format!("row-{}", id)));
        entity_su(db, &tx, name)
            .insert(vec![Some(Value::Int(*id)), label])
            .unwrap();
        tx.commit().unwrap();
    }
}

// =============================================================================
// Auto-analyzer Tests
// =============================================================================

/// Columns turning stale are analysed once; later changes to an already
/// stale column schedule nothing more.
#[test]
fn test_stale_columns_analysed() {
    let (db, scheduler) = open(config(only(|s| s.auto_analyzer = true)));
    let name = create_entity(&db, "e");
    let (id, label) = (name.column("id"), name.column("label"));
    assert!(db.statistics().is_fresh(&id));

    insert_rows(&db, &name, &[1, 2, 3]);
    assert!(!db.statistics().is_fresh(&id));
    assert_eq!(scheduler.scheduled_count(&format!("analyze:{}", id)), 1);
    assert_eq!(scheduler.scheduled_count(&format!("analyze:{}", label)), 1);
    assert_eq!(scheduler.pending(), 2);

    scheduler.run_until_idle(10);
    assert_eq!(db.metrics().analyses(), 2);

    let statistic = db.statistics().column(&id).unwrap();
    assert!(statistic.fresh);
    match statistic.metrics.unwrap() {
        ColumnMetrics::Numeric { entries, min, max, .. } => {
            assert_eq!(entries, 3);
            assert_eq!(min, Some(1.0));
            assert_eq!(max, Some(3.0));
        }
        other => panic!("unexpected metrics {:?}", other),
    }
    let labels = db.statistics().column(&label).unwrap().metrics.unwrap();
    assert_eq!(labels.entries(), 3);
    assert_eq!(labels.nulls(), 2);
}

/// Statistics changed inside a transaction are visible to it at once and
/// to everyone after commit.
#[test]
fn test_column_statistics_follow_transaction() {
    let (db, _scheduler) = open(config(ServiceConfig::disabled()));
    let name = create_entity(&db, "e");
    insert_rows(&db, &name, &[1]);

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let column = db.catalogue().resolve_column(&tx, &name.column("id")).unwrap();
    let column_su = tx.get_or_create_sub_unit(&column).unwrap();
    assert!(!column_su.statistics().unwrap().fresh);

    let mut updated = column_su.statistics().unwrap();
    updated.fresh = true;
    column_su.update_statistics(updated).unwrap();
    assert!(column_su.statistics().unwrap().fresh);
    assert!(!db.statistics().is_fresh(&name.column("id")));

    tx.commit().unwrap();
    assert!(db.statistics().is_fresh(&name.column("id")));
}

/// A failing analysis is counted and leaves the column stale.
#[test]
fn test_failed_analysis_leaves_column_stale() {
    let (db, scheduler) = open(config(only(|s| s.auto_analyzer = true)));
    let name = create_entity(&db, "e");
    insert_rows(&db, &name, &[1]);

    db.fail_points().arm(points::COLUMN_ANALYZE, 1);
    scheduler.run_until_idle(10);

    assert_eq!(db.metrics().tasks_failed(), 1);
    assert_eq!(db.metrics().analyses(), 1);
    let fresh = [name.column("id"), name.column("label")]
        .iter()
        .filter(|c| db.statistics().is_fresh(c))
        .count();
    assert_eq!(fresh, 1);
}

/// A row committed while an analysis waits for the entity lock is not
/// lost: the analysis publishes its column as stale and runs again.
#[test]
fn test_analysis_racing_a_writer_is_repeated() {
    let (db, scheduler) = open(config(only(|s| s.auto_analyzer = true)));
    let name = create_entity(&db, "e");
    insert_rows(&db, &name, &[1]);
    assert_eq!(scheduler.pending(), 2);

    let writer = db.begin(TransactionType::UserExclusive).unwrap();
    entity_su(&db, &writer, &name)
        .insert(vec![Some(Value::Int(2)), None])
        .unwrap();

    let runner = Arc::clone(&scheduler);
    let analyses = thread::spawn(move || runner.run_pending());
    // the snapshot of the first analysis is open once it is live
    while !db
        .transactions()
        .live()
        .iter()
        .any(|tx| tx.kind() == TransactionType::SystemExclusive)
    {
        thread::sleep(Duration::from_millis(1));
    }
    writer.commit().unwrap();
    assert_eq!(analyses.join().unwrap(), 2);

    // the analysis that waited missed the new row and was rescheduled
    assert_eq!(scheduler.pending(), 1);
    let stale = [name.column("id"), name.column("label")]
        .iter()
        .filter(|c| !db.statistics().is_fresh(c))
        .count();
    assert_eq!(stale, 1);

    scheduler.run_until_idle(10);
    assert_eq!(db.metrics().analyses(), 3);
    for column in [name.column("id"), name.column("label")] {
        let statistic = db.statistics().column(&column).unwrap();
        assert!(statistic.fresh, "{} should be fresh", column);
        assert_eq!(statistic.metrics.unwrap().entries(), 2);
    }
}

// =============================================================================
// Change Tracker Tests
// =============================================================================

/// Entities are recomputed once their change count reaches the threshold.
#[test]
fn test_tracker_recomputes_after_threshold() {
    let mut config = config(only(|s| s.statistics_tracker = true));
    config.statistics.changes_threshold = 3;
    let (db, scheduler) = open(config);
    let tracker = db.tracker().unwrap();
    let busy = create_entity(&db, "e1");
    let quiet = create_entity(&db, "e2");

    insert_rows(&db, &busy, &[1, 2]);
    insert_rows(&db, &quiet, &[1]);
    assert_eq!(tracker.pending_changes(&busy), Some(2));
    assert_eq!(tracker.pending_changes(&quiet), Some(1));
    assert_eq!(scheduler.pending(), 0);

    insert_rows(&db, &busy, &[3]);
    assert_eq!(tracker.pending_changes(&busy), Some(0));
    assert_eq!(scheduler.scheduled_count("statistics:s.e1"), 1);
    assert_eq!(scheduler.scheduled_count("statistics:s.e2"), 0);

    scheduler.run_until_idle(10);
    assert_eq!(db.metrics().statistics_recomputed(), 1);
    let statistic = db.statistics().column(&busy.column("id")).unwrap();
    assert!(statistic.fresh);
    assert_eq!(statistic.metrics.unwrap().entries(), 3);
    assert!(!db.statistics().is_fresh(&quiet.column("id")));
}

/// Every change of one commit is counted, and an entity gets at most one
/// recompute per commit.
#[test]
fn test_tracker_counts_each_change_of_a_commit() {
    let mut config = config(only(|s| s.statistics_tracker = true));
    config.statistics.changes_threshold = 3;
    let (db, scheduler) = open(config);
    let tracker = db.tracker().unwrap();
    let first = create_entity(&db, "e1");
    let second = create_entity(&db, "e2");

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let first_su = entity_su(&db, &tx, &first);
    first_su.insert(vec![Some(Value::Int(1)), None]).unwrap();
    first_su.insert(vec![Some(Value::Int(2)), None]).unwrap();
    entity_su(&db, &tx, &second)
        .insert(vec![Some(Value::Int(3)), None])
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(tracker.pending_changes(&first), Some(2));
    assert_eq!(tracker.pending_changes(&second), Some(1));
    assert_eq!(scheduler.pending(), 0);
}

/// With a threshold of one every change is due, still only one recompute
/// per entity of a commit is scheduled.
#[test]
fn test_tracker_schedules_once_per_entity_per_commit() {
    let mut config = config(only(|s| s.statistics_tracker = true));
    config.statistics.changes_threshold = 1;
    let (db, scheduler) = open(config);
    let first = create_entity(&db, "e1");
    let second = create_entity(&db, "e2");

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let first_su = entity_su(&db, &tx, &first);
    first_su.insert(vec![Some(Value::Int(1)), None]).unwrap();
    first_su.insert(vec![Some(Value::Int(2)), None]).unwrap();
    entity_su(&db, &tx, &second)
        .insert(vec![Some(Value::Int(3)), None])
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(scheduler.scheduled_count("statistics:s.e1"), 1);
    assert_eq!(scheduler.scheduled_count("statistics:s.e2"), 1);
    scheduler.run_until_idle(10);
    assert_eq!(db.metrics().statistics_recomputed(), 2);
    let statistic = db.statistics().column(&first.column("id")).unwrap();
    assert_eq!(statistic.metrics.unwrap().entries(), 2);
}

/// An entity whose last change is older than the change interval is due
/// regardless of the threshold.
#[test]
fn test_tracker_recomputes_after_interval() {
    let mut config = config(only(|s| s.statistics_tracker = true));
    config.statistics.change_interval_secs = 0;
    let (db, scheduler) = open(config);
    let tracker = db.tracker().unwrap();
    let name = create_entity(&db, "e");

    insert_rows(&db, &name, &[1]);
    assert_eq!(tracker.pending_changes(&name), Some(1));
    assert_eq!(scheduler.pending(), 0);

    thread::sleep(Duration::from_millis(5));
    insert_rows(&db, &name, &[2]);
    assert_eq!(tracker.pending_changes(&name), Some(0));
    assert_eq!(scheduler.scheduled_count("statistics:s.e"), 1);
}

/// A recompute for an entity dropped before it runs is skipped quietly.
#[test]
fn test_tracker_skips_dropped_entity() {
    let mut config = config(only(|s| s.statistics_tracker = true));
    config.statistics.changes_threshold = 1;
    let (db, scheduler) = open(config);
    let name = create_entity(&db, "e");
    insert_rows(&db, &name, &[1]);
    assert_eq!(scheduler.pending(), 1);

    let tx = db.begin(TransactionType::UserExclusive).unwrap();
    let schema = db.catalogue().resolve_schema(&tx, &name.schema()).unwrap();
    tx.get_or_create_sub_unit(&schema).unwrap().drop_entity(&name).unwrap();
    tx.commit().unwrap();

    scheduler.run_until_idle(10);
    assert_eq!(db.metrics().statistics_recomputed(), 0);
    assert_eq!(db.metrics().tasks_failed(), 0);
}

// =============================================================================
// Persister Tests
// =============================================================================

/// The persister writes only when the buffer changed.
#[test]
fn test_persist_only_when_dirty() {
    let (db, scheduler) = open(config(only(|s| s.statistics_persister = true)));
    let persister = db.persister().unwrap();
    create_entity(&db, "e");

    let version = db.statistics().version();
    assert_eq!(persister.persist(), PersistOutcome::Persisted(version));
    assert!(!db.statistics().is_dirty());
    assert_eq!(persister.persist(), PersistOutcome::Unchanged);

    create_entity(&db, "other");
    assert!(db.statistics().is_dirty());
    assert_eq!(scheduler.tick_periodic(), 1);
    assert!(!db.statistics().is_dirty());
    assert_eq!(db.metrics().statistics_persisted(), 2);
}

/// A failed persist keeps the buffer dirty for the next period.
#[test]
fn test_failed_persist_stays_dirty() {
    let (db, _scheduler) = open(config(only(|s| s.statistics_persister = true)));
    let persister = db.persister().unwrap();
    create_entity(&db, "e");

    db.fail_points().arm(points::STATISTICS_PERSIST, 1);
    assert_eq!(persister.persist(), PersistOutcome::Failed);
    assert!(db.statistics().is_dirty());
    assert_eq!(db.metrics().tasks_failed(), 1);

    assert!(matches!(persister.persist(), PersistOutcome::Persisted(_)));
    assert!(!db.statistics().is_dirty());
}

/// Persisted statistics are loaded again when the database reopens.
#[test]
fn test_persisted_statistics_survive_reopen() {
    let env = Environment::new();
    let services = only(|s| {
        s.auto_analyzer = true;
        s.statistics_persister = true;
    });
    let name = {
        let scheduler = ManualScheduler::new();
        let db = Database::open_with(
            Arc::clone(&env),
            config(services.clone()),
            Some(Arc::clone(&scheduler) as Arc<dyn Scheduler>),
        )
        .unwrap();
        let name = create_entity(&db, "e");
        insert_rows(&db, &name, &[4, 5]);
        scheduler.run_until_idle(10);
        assert!(matches!(db.persister().unwrap().persist(), PersistOutcome::Persisted(_)));
        name
    };

    let db = Database::open_with(Arc::clone(&env), config(services), None).unwrap();
    let statistic = db.statistics().column(&name.column("id")).unwrap();
    assert!(statistic.fresh);
    assert_eq!(statistic.metrics.unwrap().entries(), 2);
    assert!(!db.statistics().is_dirty());
}
