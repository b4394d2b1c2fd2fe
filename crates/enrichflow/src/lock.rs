//! At-most-one-runner execution lock.
//!
//! Every instance of the worker shares one database and one schedule, so each
//! tick fires everywhere at once. The lock decides which instance actually runs
//! it. A caller that does not get the lock skips the tick; nothing is queued or
//! retried.

use sqlx::PgPool;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs `body` only if the named lock is free.
///
/// Returns `true` when `body` ran to completion without error. `false` covers
/// both "someone else holds the lock" and "acquiring or running failed"; the
/// two are only told apart in the logs.
pub trait ExecutionLock: Send + Sync {
    fn run_exclusive<'a>(
        &'a self,
        lock_name: &'a str,
        body: BoxFuture<'a, anyhow::Result<()>>,
    ) -> BoxFuture<'a, bool>;
}

/// Transaction-scoped Postgres advisory lock keyed by `hashtext(lock_name)`.
#[derive(Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ExecutionLock for PgAdvisoryLock {
    fn run_exclusive<'a>(
        &'a self,
        lock_name: &'a str,
        body: BoxFuture<'a, anyhow::Result<()>>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(run_with_lock(&self.pool, lock_name, body))
    }
}

pub async fn run_with_lock<F>(pool: &PgPool, lock_name: &str, body: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match try_run_with_lock(pool, lock_name, body).await {
        Ok(ran) => ran,
        Err(e) => {
            tracing::error!(lock = lock_name, error = %e, "failed to run with task lock");
            false
        }
    }
}

async fn try_run_with_lock<F>(pool: &PgPool, lock_name: &str, body: F) -> anyhow::Result<bool>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let mut tx = pool.begin().await?;

    // Non-blocking: returns false at once when another session holds it.
    let locked: bool =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(lock_name)
            .fetch_one(&mut *tx)
            .await?;

    if !locked {
        tx.rollback().await?;
        return Ok(false);
    }

    // The lock goes away with the transaction, whichever way it ends.
    match body.await {
        Ok(()) => {
            tx.commit().await?;
            Ok(true)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

/// Same contract as [`PgAdvisoryLock`], scoped to this process.
///
/// Enough for a single-instance deployment, and what the tests use.
#[derive(Clone, Default)]
pub struct InProcessLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, lock_name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(lock_name))
            .unwrap_or(false)
    }

    fn try_acquire(&self, lock_name: &str) -> Option<HeldName<'_>> {
        let mut held = self.held.lock().ok()?;
        if !held.insert(lock_name.to_string()) {
            return None;
        }
        Some(HeldName {
            held: &self.held,
            name: lock_name.to_string(),
        })
    }
}

struct HeldName<'a> {
    held: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for HeldName<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.name);
        }
    }
}

impl ExecutionLock for InProcessLock {
    fn run_exclusive<'a>(
        &'a self,
        lock_name: &'a str,
        body: BoxFuture<'a, anyhow::Result<()>>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(_guard) = self.try_acquire(lock_name) else {
                return false;
            };

            match body.await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(lock = lock_name, error = %e, "failed to run with task lock");
                    false
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn in_process_lock_turns_away_second_holder() {
        let lock = InProcessLock::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (entered_tx, entered_rx) = oneshot::channel::<()>();

        let first = {
            let lock = lock.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                lock.run_exclusive(
                    "task:a",
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok::<(), anyhow::Error>(())
                    }),
                )
                .await
            })
        };

        entered_rx.await.unwrap();
        assert!(lock.is_held("task:a"));

        let calls2 = calls.clone();
        let second = lock
            .run_exclusive(
                "task:a",
                Box::pin(async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }),
            )
            .await;
        assert!(!second, "second caller must not run while the lock is held");

        release_tx.send(()).unwrap();
        assert!(first.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held("task:a"));
    }

    #[tokio::test]
    async fn in_process_lock_reports_body_error_as_not_run_and_releases() {
        let lock = InProcessLock::new();

        let ran = lock
            .run_exclusive("task:b", Box::pin(async { Err::<(), _>(anyhow::anyhow!("boom")) }))
            .await;
        assert!(!ran);
        assert!(!lock.is_held("task:b"));

        let ran = lock.run_exclusive("task:b", Box::pin(async { Ok::<(), anyhow::Error>(()) })).await;
        assert!(ran);
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let lock = InProcessLock::new();
        let inner = lock.clone();
        let ran = lock
            .run_exclusive(
                "task:x",
                Box::pin(async move {
                    let nested = inner.run_exclusive("task:y", Box::pin(async { Ok::<(), anyhow::Error>(()) })).await;
                    anyhow::ensure!(nested, "task:y should have been free");
                    Ok(())
                }),
            )
            .await;
        assert!(ran);
    }
}
