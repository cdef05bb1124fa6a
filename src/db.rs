//! Pooled MySQL access with scoped acquisition.
//!
//! [`SessionManager`] owns the pool and hands out two kinds of scope:
//!
//! - [`SessionManager::connect`] runs a closure inside a transaction that is
//!   committed when the closure returns `Ok` and rolled back when it returns
//!   `Err`.
//! - [`SessionManager::session`] runs a closure with a [`Session`] whose work
//!   is only persisted by an explicit [`Session::commit`]. The session is
//!   rolled back on `Err` and closed when the scope exits.
//!
//! In both cases the closure's error is handed back to the caller unchanged.
//! Once [`SessionManager::close`] has run, every acquisition fails with
//! [`DbError::Uninitialized`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    ConnectOptions, MySql, MySqlConnection, MySqlPool, Transaction,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database session is uninitialized.")]
    Uninitialized,
    #[error("database scope has already ended")]
    ScopeEnded,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub fn connect_options(settings: &Settings) -> MySqlConnectOptions {
    let options = MySqlConnectOptions::new()
        .host(&settings.db_host)
        .port(settings.db_port)
        .username(&settings.db_user)
        .password(&settings.db_password)
        .database(&settings.db_database);
    if settings.db_echo {
        options
    } else {
        options.disable_statement_logging()
    }
}

pub fn pool_options(settings: &Settings) -> MySqlPoolOptions {
    MySqlPoolOptions::new().max_connections(settings.db_max_connections)
}

pub struct SessionManager {
    pool: RwLock<Option<MySqlPool>>,
}

impl SessionManager {
    /// Opens the pool and checks that the database is reachable.
    pub async fn connect_with(settings: &Settings) -> Result<Self, DbError> {
        let pool = pool_options(settings)
            .connect_with(connect_options(settings))
            .await?;
        info!(
            host = %settings.db_host,
            database = %settings.db_database,
            max_connections = settings.db_max_connections,
            "database pool ready"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self {
            pool: RwLock::new(Some(pool)),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Handle to the underlying pool, for work that lives outside a scope
    /// such as migrations.
    pub async fn pool(&self) -> Result<MySqlPool, DbError> {
        self.pool.read().await.clone().ok_or(DbError::Uninitialized)
    }

    /// Closes the pool. The manager is unusable afterwards.
    pub async fn close(&self) -> Result<(), DbError> {
        let pool = self.pool.write().await.take().ok_or(DbError::Uninitialized)?;
        pool.close().await;
        info!("database pool closed");
        Ok(())
    }

    /// Runs `f` inside a transaction: commit on `Ok`, rollback on `Err`.
    pub async fn connect<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut DbConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let pool = self.pool().await?;
        let tx = pool.begin().await.map_err(DbError::from)?;
        scoped(DbConnection { tx: Some(tx) }, f).await
    }

    /// Runs `f` with a fresh [`Session`], rolled back on `Err` and always
    /// closed on exit.
    pub async fn session<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let pool = self.pool().await?;
        scoped(Session::new(pool), f).await
    }
}

/// A resource whose lifetime is bounded by one scope.
#[async_trait]
pub trait Scope: Send + Sized {
    /// Undo uncommitted work after the scope body failed.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Called exactly once when the scope exits, on every path.
    async fn release(self) -> Result<(), DbError>;
}

/// Runs `f` against `resource`, rolling back on error and releasing on every
/// exit path. The body's error wins over any cleanup error.
pub async fn scoped<S, F, T, E>(mut resource: S, f: F) -> Result<T, E>
where
    S: Scope,
    F: for<'c> FnOnce(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
    E: From<DbError>,
{
    let outcome = f(&mut resource).await;

    if outcome.is_err() {
        if let Err(e) = resource.rollback().await {
            warn!(error = %e, "rollback after failed scope failed");
        }
    }

    let released = resource.release().await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(E::from(e)),
        (Err(e), released) => {
            if let Err(release_err) = released {
                warn!(error = %release_err, "release after failed scope failed");
            }
            Err(e)
        }
    }
}

/// A transactional connection handed out by [`SessionManager::connect`].
pub struct DbConnection {
    tx: Option<Transaction<'static, MySql>>,
}

impl DbConnection {
    /// The executor for queries inside this scope.
    pub fn conn(&mut self) -> Result<&mut MySqlConnection, DbError> {
        self.tx.as_deref_mut().ok_or(DbError::ScopeEnded)
    }
}

#[async_trait]
impl Scope for DbConnection {
    async fn rollback(&mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!("connection scope rolled back");
        }
        Ok(())
    }

    async fn release(mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

/// Unit of work bound to the pool. A transaction is begun on first use and
/// persisted only by [`Session::commit`].
pub struct Session {
    pool: MySqlPool,
    tx: Option<Transaction<'static, MySql>>,
    closed: bool,
}

impl Session {
    fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            tx: None,
            closed: false,
        }
    }

    /// The executor for queries, beginning a transaction when none is open.
    pub async fn conn(&mut self) -> Result<&mut MySqlConnection, DbError> {
        if self.closed {
            return Err(DbError::ScopeEnded);
        }
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(&mut **self.tx.insert(tx))
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn commit(&mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    /// Discards uncommitted work and ends the session.
    pub async fn close(&mut self) -> Result<(), DbError> {
        self.closed = true;
        self.rollback().await
    }
}

#[async_trait]
impl Scope for Session {
    async fn rollback(&mut self) -> Result<(), DbError> {
        Session::rollback(self).await?;
        debug!("session rolled back");
        Ok(())
    }

    async fn release(mut self) -> Result<(), DbError> {
        self.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_settings;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("body failed: {0}")]
        Body(&'static str),
        #[error(transparent)]
        Db(#[from] DbError),
    }

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<&'static str>>>);

    impl Calls {
        fn push(&self, call: &'static str) {
            self.0.lock().unwrap().push(call);
        }
        fn get(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeScope {
        calls: Calls,
        fail_release: bool,
    }

    #[async_trait]
    impl Scope for FakeScope {
        async fn rollback(&mut self) -> Result<(), DbError> {
            self.calls.push("rollback");
            Ok(())
        }

        async fn release(self) -> Result<(), DbError> {
            self.calls.push("release");
            if self.fail_release {
                Err(DbError::ScopeEnded)
            } else {
                Ok(())
            }
        }
    }

    fn fake(calls: &Calls) -> FakeScope {
        FakeScope {
            calls: calls.clone(),
            fail_release: false,
        }
    }

    fn lazy_manager() -> SessionManager {
        let settings = test_settings();
        let pool = pool_options(&settings).connect_lazy_with(connect_options(&settings));
        SessionManager::from_pool(pool)
    }

    #[tokio::test]
    async fn successful_scope_releases_once_without_rollback() {
        let calls = Calls::default();
        let out: Result<u32, TestError> = scoped(fake(&calls), |scope| {
            Box::pin(async move {
                scope.calls.push("body");
                Ok(7)
            })
        })
        .await;

        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), vec!["body", "release"]);
    }

    #[tokio::test]
    async fn failed_scope_rolls_back_then_releases_and_returns_same_error() {
        let calls = Calls::default();
        let out: Result<u32, TestError> = scoped(fake(&calls), |scope| {
            Box::pin(async move {
                scope.calls.push("body");
                Err(TestError::Body("boom"))
            })
        })
        .await;

        assert!(matches!(out, Err(TestError::Body("boom"))));
        assert_eq!(calls.get(), vec!["body", "rollback", "release"]);
    }

    #[tokio::test]
    async fn release_failure_after_success_is_reported() {
        let calls = Calls::default();
        let scope = FakeScope {
            calls: calls.clone(),
            fail_release: true,
        };
        let out: Result<(), TestError> = scoped(scope, |_| Box::pin(async { Ok(()) })).await;

        assert!(matches!(out, Err(TestError::Db(DbError::ScopeEnded))));
        assert_eq!(calls.get(), vec!["release"]);
    }

    #[tokio::test]
    async fn release_failure_does_not_mask_body_error() {
        let calls = Calls::default();
        let scope = FakeScope {
            calls: calls.clone(),
            fail_release: true,
        };
        let out: Result<(), TestError> =
            scoped(scope, |_| Box::pin(async { Err(TestError::Body("first")) })).await;

        assert!(matches!(out, Err(TestError::Body("first"))));
        assert_eq!(calls.get(), vec!["rollback", "release"]);
    }

    #[tokio::test]
    async fn untouched_session_needs_no_connection() {
        let manager = lazy_manager();
        let out: Result<bool, DbError> = manager
            .session(|session| Box::pin(async move { Ok(session.in_transaction()) }))
            .await;
        assert!(!out.unwrap());
    }

    #[tokio::test]
    async fn session_error_propagates_unchanged() {
        let manager = lazy_manager();
        let out: Result<(), TestError> = manager
            .session(|_| Box::pin(async { Err(TestError::Body("handler")) }))
            .await;
        assert!(matches!(out, Err(TestError::Body("handler"))));
    }

    #[tokio::test]
    async fn closed_session_rejects_further_use() {
        let manager = lazy_manager();
        let out: Result<(), DbError> = manager
            .session(|session| {
                Box::pin(async move {
                    session.close().await?;
                    session.conn().await?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(out, Err(DbError::ScopeEnded)));
    }

    #[tokio::test]
    async fn acquisition_after_close_is_uninitialized() {
        let manager = lazy_manager();
        assert!(manager.is_initialized().await);

        manager.close().await.unwrap();
        assert!(!manager.is_initialized().await);

        let session: Result<(), DbError> =
            manager.session(|_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(session, Err(DbError::Uninitialized)));

        let conn: Result<(), DbError> = manager.connect(|_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(conn, Err(DbError::Uninitialized)));

        assert!(matches!(manager.pool().await, Err(DbError::Uninitialized)));
    }

    #[tokio::test]
    async fn session_rollback_and_release_leave_nothing_open() {
        let manager = lazy_manager();
        let mut session = Session::new(manager.pool().await.unwrap());

        Scope::rollback(&mut session).await.unwrap();
        assert!(session.tx.is_none());
        assert!(!session.closed);

        session.close().await.unwrap();
        assert!(session.tx.is_none());
        assert!(session.closed);
        assert!(matches!(session.conn().await, Err(DbError::ScopeEnded)));

        Scope::release(session).await.unwrap();
    }

    #[tokio::test]
    async fn rolled_back_connection_has_nothing_to_commit() {
        let mut conn = DbConnection { tx: None };

        Scope::rollback(&mut conn).await.unwrap();
        assert!(conn.tx.is_none());
        assert!(matches!(conn.conn(), Err(DbError::ScopeEnded)));

        Scope::release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn second_close_is_uninitialized() {
        let manager = lazy_manager();
        manager.close().await.unwrap();
        assert!(matches!(manager.close().await, Err(DbError::Uninitialized)));
    }

    #[test]
    fn uninitialized_message_matches() {
        assert_eq!(
            DbError::Uninitialized.to_string(),
            "Database session is uninitialized."
        );
    }
}
