//! Tests for sqlsink-rdbc pool module

use sqlsink_rdbc::prelude::*;
use sqlsink_rdbc::testing::{MemoryBackend, MemoryConnectionFactory};

async fn memory_pool(backend: &MemoryBackend, config: PoolConfig) -> Arc<SimpleConnectionPool> {
    SimpleConnectionPool::new(
        config,
        Arc::new(MemoryConnectionFactory::new(backend.clone())),
    )
    .await
    .unwrap()
}

fn small_config(max_size: usize) -> PoolConfig {
    PoolConfig::new("memory://")
        .with_min_size(0)
        .with_max_size(max_size)
        .with_acquire_timeout(Duration::from_millis(50))
}

// ==================== PoolConfig Tests ====================

#[test]
fn test_pool_config_default() {
    let config = PoolConfig::default();

    assert_eq!(config.min_size, 1);
    assert_eq!(config.max_size, 8);
    assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    assert_eq!(config.idle_timeout, Duration::from_secs(600));
    assert_eq!(config.health_check_interval, Duration::from_secs(15));
    assert!(config.test_on_borrow);
    assert!(!config.test_on_return);
}

#[test]
fn test_pool_config_new() {
    let config = PoolConfig::new("postgres://localhost/test");

    assert_eq!(config.connection.url, "postgres://localhost/test");
    assert_eq!(config.min_size, 1);
}

// ==================== PoolStats Tests ====================

#[test]
fn test_pool_stats_default() {
    let stats = PoolStats::default();

    assert_eq!(stats.connections_created, 0);
    assert_eq!(stats.acquisitions, 0);
    assert_eq!(stats.exhausted_count, 0);
    assert_eq!(stats.health_check_failures, 0);
}

// ==================== SimpleConnectionPool Tests ====================

#[tokio::test]
async fn test_zero_max_size_rejected() {
    let backend = MemoryBackend::new();
    let result = SimpleConnectionPool::new(
        PoolConfig::new("memory://").with_max_size(0),
        Arc::new(MemoryConnectionFactory::new(backend)),
    )
    .await;

    assert_eq!(
        result.err().map(|e| e.category()),
        Some(ErrorCategory::Configuration)
    );
}

#[tokio::test]
async fn test_min_size_opened_eagerly() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, PoolConfig::new("memory://").with_min_size(3)).await;

    assert_eq!(backend.connections_opened(), 3);
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.idle(), 3);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_pick_one_and_run_executes_once() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(2)).await;

    let options = ExecutionOptions::with_database("metrics");
    let affected = pick_one_and_run(
        &*pool,
        &Statement::with_options("INSERT INTO t (a) VALUES (1)", &options),
    )
    .await
    .unwrap();

    assert_eq!(affected, 1);
    let statements = backend.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].sql, "INSERT INTO t (a) VALUES (1)");
    assert_eq!(statements[0].database.as_deref(), Some("metrics"));
    assert_eq!(pool.stats().acquisitions, 1);
}

#[tokio::test]
async fn test_connections_are_reused() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(2)).await;

    for _ in 0..5 {
        pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
            .await
            .unwrap();
        // Returned connections come back through a spawned task
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(backend.connections_opened(), 1);
    assert_eq!(backend.statements().len(), 5);
}

#[tokio::test]
async fn test_unset_database_does_not_inherit_previous_namespace() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1)).await;

    let tenant = ExecutionOptions::with_database("tenant_a");
    pick_one_and_run(&*pool, &Statement::with_options("INSERT INTO a VALUES (1)", &tenant))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    pick_one_and_run(&*pool, &Statement::new("INSERT INTO b VALUES (1)"))
        .await
        .unwrap();

    let statements = backend.statements();
    assert_eq!(backend.connections_opened(), 1);
    assert_eq!(statements[0].database.as_deref(), Some("tenant_a"));
    assert_eq!(statements[1].database, None);
}

#[tokio::test]
async fn test_borrow_replaces_connections_severed_by_restart() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1).with_min_size(1)).await;

    backend.drop_connections();
    pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();

    assert_eq!(backend.connections_opened(), 2);
    assert_eq!(pool.stats().health_check_failures, 1);
}

#[tokio::test]
async fn test_connection_failure_discards_connection() {
    let backend = MemoryBackend::new();
    let config = small_config(1).with_min_size(1).with_test_on_borrow(false);
    let pool = memory_pool(&backend, config).await;

    backend.drop_connections();
    let err = pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Driver(ref e) if e.category() == ErrorCategory::Connection));

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.idle(), 0);

    pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();
    assert_eq!(backend.statements().len(), 1);
}

#[tokio::test]
async fn test_max_lifetime_survives_reuse() {
    let backend = MemoryBackend::new();
    let config = small_config(1).with_max_lifetime(Duration::from_millis(50));
    let pool = memory_pool(&backend, config).await;

    let first = pool.get().await.unwrap().created_at();
    let mut latest = first;
    for _ in 0..10 {
        latest = pool.get().await.unwrap().created_at();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(latest > first);

    assert!(backend.connections_opened() >= 2);
    assert!(pool.stats().connections_closed >= 1);
}

#[tokio::test]
async fn test_exhausted_pool_is_empty_error() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1)).await;

    let held = pool.get().await.unwrap();
    let err = pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Empty(_)));
    assert!(err.inner().is_retriable());
    assert_eq!(pool.stats().exhausted_count, 1);
    assert!(backend.statements().is_empty());
    drop(held);
}

#[tokio::test]
async fn test_refused_connection_is_empty_error() {
    let backend = MemoryBackend::new();
    backend.set_refuse_connections(true);
    let pool = memory_pool(&backend, small_config(1)).await;

    let err = pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Empty(_)));

    // The permit is released, so a later attempt can succeed
    backend.set_refuse_connections(false);
    assert!(pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_statement_failure_is_driver_error() {
    let backend = MemoryBackend::new();
    backend.fail_with("relation \"t\" does not exist");
    let pool = memory_pool(&backend, small_config(1)).await;

    let err = pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap_err();

    match err {
        PoolError::Driver(e) => {
            assert_eq!(e.category(), ErrorCategory::Query);
            assert_eq!(e.sql(), Some("INSERT INTO t VALUES (1)"));
        }
        other => panic!("expected driver error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_database_never_reaches_backend() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1)).await;

    let options = ExecutionOptions::with_database("x; DROP TABLE t");
    let err = pick_one_and_run(&*pool, &Statement::with_options("SELECT 1", &options))
        .await
        .unwrap_err();

    assert_eq!(err.inner().category(), ErrorCategory::Configuration);
    assert!(backend.statements().is_empty());
}

#[tokio::test]
async fn test_health_check_all_healthy() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, PoolConfig::new("memory://").with_min_size(2)).await;

    assert_eq!(pool.health_check_all().await, vec![true, true]);
    assert_eq!(pool.idle(), 2);
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn test_health_check_all_drops_dead_connections() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, PoolConfig::new("memory://").with_min_size(2)).await;

    backend.set_healthy(false);
    assert_eq!(pool.health_check_all().await, vec![false, false]);
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().health_check_failures, 2);
    assert_eq!(pool.stats().connections_closed, 2);
}

#[tokio::test]
async fn test_health_check_without_idle_connections() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1)).await;

    assert_eq!(pool.health_check_all().await, vec![true]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    backend.set_healthy(false);
    assert!(!pool.health_check_all().await.contains(&true));

    backend.set_refuse_connections(true);
    assert_eq!(pool.health_check_all().await, vec![false]);
}

#[tokio::test]
async fn test_health_check_stays_within_max_size() {
    let backend = MemoryBackend::new();
    backend.set_latency(Duration::from_millis(50));
    let config = PoolConfig::new("memory://")
        .with_min_size(2)
        .with_max_size(2)
        .with_acquire_timeout(Duration::from_secs(2));
    let pool = memory_pool(&backend, config).await;

    let insert = Statement::new("INSERT INTO t VALUES (1)");
    let (health, first, second) = tokio::join!(
        pool.health_check_all(),
        pick_one_and_run(&*pool, &insert),
        pick_one_and_run(&*pool, &insert),
    );

    assert!(health.iter().all(|alive| *alive));
    assert!(first.is_ok() && second.is_ok());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.connections_opened(), 2);
    assert!(pool.size() <= 2);
}

#[tokio::test]
async fn test_health_check_of_busy_pool_does_not_wait() {
    let backend = MemoryBackend::new();
    let config = PoolConfig::new("memory://")
        .with_min_size(1)
        .with_max_size(1)
        .with_acquire_timeout(Duration::from_secs(5));
    let pool = memory_pool(&backend, config).await;

    let held = pool.get().await.unwrap();
    let started = std::time::Instant::now();
    assert_eq!(pool.health_check_all().await, vec![true]);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.stats().exhausted_count, 0);
    drop(held);
}

#[tokio::test]
async fn test_busy_pool_reports_last_sample() {
    let backend = MemoryBackend::new();
    let config = PoolConfig::new("memory://").with_min_size(1).with_max_size(1);
    let pool = memory_pool(&backend, config).await;

    backend.set_healthy(false);
    assert_eq!(pool.health_check_all().await, vec![false]);

    backend.set_healthy(true);
    let held = pool.get().await.unwrap();
    backend.set_healthy(false);
    assert_eq!(pool.health_check_all().await, vec![false]);
    drop(held);
}

#[tokio::test]
async fn test_pool_reports_backend_type() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, small_config(1)).await;
    assert_eq!(pool.database_type(), DatabaseType::Memory);
}

#[tokio::test]
async fn test_closed_pool_refuses_work() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend, PoolConfig::new("memory://").with_min_size(2)).await;

    pool.close().await.unwrap();
    assert_eq!(pool.size(), 0);

    let err = pick_one_and_run(&*pool, &Statement::new("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Empty(_)));
    assert!(pool.health_check_all().await.is_empty());
}
