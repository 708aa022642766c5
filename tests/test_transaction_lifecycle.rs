use rookdb::config::StorageConfig;
use rookdb::executor::RookEngine;
use rookdb::Error;

fn open_engine(dir: &tempfile::TempDir) -> RookEngine {
    let config = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        buffer_pool_pages: 64,
        checkpoint_interval_txns: 0,
        fsync_enabled: true,
    };
    RookEngine::open(config).unwrap()
}

#[test]
fn test_transaction_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open_engine(&dir);

    let result = engine.execute_sql("BEGIN TRANSACTION").unwrap();
    assert!(result.message.unwrap().contains("started"));

    let result = engine.execute_sql("COMMIT").unwrap();
    assert!(result.message.unwrap().contains("committed"));

    engine.execute_sql("BEGIN").unwrap();
    let result = engine.execute_sql("ROLLBACK").unwrap();
    assert!(result.message.unwrap().contains("rolled back"));
}

#[test]
fn test_nested_begin_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open_engine(&dir);

    engine.execute_sql("BEGIN").unwrap();
    assert!(matches!(
        engine.execute_sql("BEGIN"),
        Err(Error::TransactionActive)
    ));
    engine.execute_sql("ROLLBACK").unwrap();
}

#[test]
fn test_commit_without_transaction_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open_engine(&dir);

    assert!(matches!(
        engine.execute_sql("COMMIT"),
        Err(Error::NoActiveTransaction)
    ));
    assert!(matches!(
        engine.execute_sql("ROLLBACK"),
        Err(Error::NoActiveTransaction)
    ));
}

#[test]
fn test_committed_changes_survive_rollback_of_next_txn() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open_engine(&dir);

    engine
        .execute_sql("CREATE TABLE t (id INT PRIMARY KEY, v VARCHAR(10))")
        .unwrap();

    engine.execute_sql("BEGIN").unwrap();
    engine.execute_sql("INSERT INTO t VALUES (1, 'keep')").unwrap();
    engine.execute_sql("COMMIT").unwrap();

    engine.execute_sql("BEGIN").unwrap();
    engine.execute_sql("INSERT INTO t VALUES (2, 'drop')").unwrap();
    engine
        .execute_sql("UPDATE t SET v = 'changed' WHERE id = 1")
        .unwrap();
    engine.execute_sql("ROLLBACK").unwrap();

    let result = engine.execute_sql("SELECT v FROM t ORDER BY id").unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get(0).unwrap().to_string(), "keep");
}
