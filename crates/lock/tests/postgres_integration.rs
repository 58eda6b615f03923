//! PostgreSQL integration tests for the lock.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p lock --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use lock::{DistributedLock, FencingToken, PostgresLock, keys::payment_lock_key};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const TTL: Duration = Duration::from_secs(30);

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/003_create_lock_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_locks, lock_fencing_sequences, lock_resource_tokens")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

#[tokio::test]
#[serial]
async fn test_only_one_holder_at_a_time() {
    let pool = get_test_pool().await;
    let a = PostgresLock::with_holder_id(pool.clone(), "a");
    let b = PostgresLock::with_holder_id(pool, "b");
    let key = payment_lock_key(500);

    let grant = a.try_acquire(&key, TTL).await.unwrap();
    assert!(grant.granted);
    let token = grant.fencing_token.unwrap();
    assert_eq!(token, FencingToken::new(1));

    assert!(!b.try_acquire(&key, TTL).await.unwrap().granted);
    assert!(!b.release(&key, FencingToken::new(2)).await.unwrap());
    assert_eq!(b.holder(&key).await.unwrap().unwrap().holder_id, "a");

    assert!(a.release(&key, token).await.unwrap());
    let grant = b.try_acquire(&key, TTL).await.unwrap();
    assert!(grant.granted);
    assert_eq!(grant.fencing_token, Some(FencingToken::new(2)));
}

#[tokio::test]
#[serial]
async fn test_refused_attempt_does_not_consume_a_token() {
    let pool = get_test_pool().await;
    let a = PostgresLock::with_holder_id(pool.clone(), "a");
    let b = PostgresLock::with_holder_id(pool, "b");

    let token = a.try_acquire("k", TTL).await.unwrap().fencing_token.unwrap();
    for _ in 0..3 {
        assert!(!b.try_acquire("k", TTL).await.unwrap().granted);
    }
    a.release("k", token).await.unwrap();

    let grant = b.try_acquire("k", TTL).await.unwrap();
    assert_eq!(grant.fencing_token, Some(FencingToken::new(2)));
}

#[tokio::test]
#[serial]
async fn test_expired_lease_is_taken_over() {
    let pool = get_test_pool().await;
    let a = PostgresLock::with_holder_id(pool.clone(), "a");
    let b = PostgresLock::with_holder_id(pool, "b");

    let first = a
        .try_acquire("k", Duration::from_millis(100))
        .await
        .unwrap()
        .fencing_token
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!a.is_locked("k").await.unwrap());
    assert!(!a.extend("k", first, TTL).await.unwrap());

    let second = b.try_acquire("k", TTL).await.unwrap().fencing_token.unwrap();
    assert!(second > first);
    assert!(!a.release("k", first).await.unwrap());
    assert!(b.is_locked("k").await.unwrap());

    assert!(b.validate_fencing_token("order:500", second).await.unwrap());
    assert!(!a.validate_fencing_token("order:500", first).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_extend_and_release_all() {
    let pool = get_test_pool().await;
    let a = PostgresLock::with_holder_id(pool.clone(), "a");
    let b = PostgresLock::with_holder_id(pool, "b");

    let k1 = a.try_acquire("k1", TTL).await.unwrap().fencing_token.unwrap();
    a.try_acquire("k2", TTL).await.unwrap();
    b.try_acquire("k3", TTL).await.unwrap();

    assert!(a.extend("k1", k1, Duration::from_secs(300)).await.unwrap());
    assert!(
        !b.extend("k1", FencingToken::new(k1.sequence() + 1), Duration::from_secs(300))
            .await
            .unwrap()
    );

    let mut held = a.held_keys().await.unwrap();
    held.sort();
    assert_eq!(held, vec!["k1".to_string(), "k2".to_string()]);

    assert_eq!(a.release_all().await.unwrap(), 2);
    assert!(!b.is_locked("k1").await.unwrap());
    assert!(b.is_locked("k3").await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_concurrent_acquirers_get_one_grant() {
    let pool = get_test_pool().await;
    let mut handles = Vec::new();
    for i in 0..8 {
        let client = PostgresLock::with_holder_id(pool.clone(), format!("holder-{i}"));
        handles.push(tokio::spawn(async move {
            client.try_acquire("contended", TTL).await.unwrap().granted
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}
