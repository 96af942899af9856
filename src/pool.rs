//! Lazily opened connections, one per (dialect, database).
//!
//! The pool also carries the transaction depth of each connection. Only the
//! outermost `begin`/`commit`/`rollback` reaches the database; a rollback at
//! an inner level dooms the enclosing transaction so that its final commit
//! rolls back instead.
//!
//! Work that must only become visible once the data is durable (cache and
//! search updates, archive checkins) is queued with [`ConnectionPool::on_commit`]
//! and handed back by the outermost commit. Undo work queued with
//! [`ConnectionPool::on_rollback`] runs when the transaction rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Credentials;
use crate::driver::{Connection, Connector, DialectKind};
use crate::entity::NameHasher;
use crate::error::{NodecladError, Result};

type PoolKey = (DialectKind, String);

/// Work queued until the outermost transaction settles.
pub type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Runs undo work newest first. Failures are logged and do not stop the rest.
fn undo(hooks: Vec<Hook>) {
    for hook in hooks.into_iter().rev() {
        if let Err(e) = hook() {
            warn!(error = %e, "undo after rollback failed");
        }
    }
}

struct Slot {
    connection: Option<Box<dyn Connection>>,
    credentials: Credentials,
    depth: usize,
    doomed: bool,
    on_commit: Vec<Hook>,
    on_rollback: Vec<Hook>,
}

impl Slot {
    fn open(&mut self, connector: &dyn Connector) -> Result<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            debug!(dialect = %connector.dialect(), database = %self.credentials.database, "connecting");
            self.connection = Some(connector.connect(&self.credentials)?);
        }
        self.connection.as_mut().ok_or_else(|| NodecladError::DbConnectFailed {
            dialect: connector.dialect().to_string(),
            database: self.credentials.database.clone(),
            message: "connection vanished".to_string(),
        })
    }
}

pub struct ConnectionPool {
    connectors: Vec<Arc<dyn Connector>>,
    slots: Mutex<HashMap<PoolKey, Arc<Mutex<Slot>>, NameHasher>>,
    reconnect_delay: Duration,
}

impl ConnectionPool {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self { connectors: Vec::new(), slots: Mutex::new(HashMap::default()), reconnect_delay }
    }

    /// Registers a connector. A later connector for the same dialect wins.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.retain(|c| c.dialect() != connector.dialect());
        self.connectors.push(connector);
    }

    pub fn has_connector(&self, dialect: DialectKind) -> bool {
        self.connectors.iter().any(|c| c.dialect() == dialect)
    }

    fn connector(&self, dialect: DialectKind, database: &str) -> Result<&Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.dialect() == dialect)
            .ok_or_else(|| NodecladError::DbConnectFailed {
                dialect: dialect.to_string(),
                database: database.to_string(),
                message: "no connector registered for this dialect".to_string(),
            })
    }

    fn slot(&self, dialect: DialectKind, credentials: &Credentials) -> Result<Arc<Mutex<Slot>>> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry((dialect, credentials.database.clone())).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                connection: None,
                credentials: credentials.clone(),
                depth: 0,
                doomed: false,
                on_commit: Vec::new(),
                on_rollback: Vec::new(),
            }))
        });
        Ok(slot.clone())
    }

    /// Runs `work` on the pooled connection. When the connection turns out to
    /// be dropped and no transaction is open on it, the connection is
    /// reopened and `work` is retried exactly once.
    pub fn run<T, F>(&self, dialect: DialectKind, credentials: &Credentials, mut work: F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        let connector = self.connector(dialect, &credentials.database)?;
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        let first = {
            let connection = slot.open(connector.as_ref())?;
            work(&mut **connection)
        };
        match first {
            Err(e) if e.is_connection_lost() && slot.depth == 0 => {
                warn!(
                    dialect = %dialect,
                    database = %credentials.database,
                    error = %e,
                    "connection lost, reconnecting once"
                );
                slot.connection = None;
                if !self.reconnect_delay.is_zero() {
                    thread::sleep(self.reconnect_delay);
                }
                let connection = slot.open(connector.as_ref())?;
                work(&mut **connection)
            }
            other => other,
        }
    }

    pub fn depth(&self, dialect: DialectKind, credentials: &Credentials) -> Result<usize> {
        Ok(self.slot(dialect, credentials)?.lock()?.depth)
    }

    pub fn begin(&self, dialect: DialectKind, credentials: &Credentials) -> Result<()> {
        let connector = self.connector(dialect, &credentials.database)?;
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        if slot.depth == 0 {
            let statement = dialect.dialect().begin();
            slot.open(connector.as_ref())?.execute_batch(statement)?;
            slot.doomed = false;
        }
        slot.depth += 1;
        Ok(())
    }

    /// Queues `hook` for after the outermost commit. Outside a transaction
    /// it runs right away.
    pub fn on_commit(&self, dialect: DialectKind, credentials: &Credentials, hook: Hook) -> Result<()> {
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        if slot.depth == 0 {
            drop(slot);
            return hook();
        }
        slot.on_commit.push(hook);
        Ok(())
    }

    /// Queues `hook` for when the open transaction rolls back. Outside a
    /// transaction there is nothing to undo and the hook is dropped.
    pub fn on_rollback(&self, dialect: DialectKind, credentials: &Credentials, hook: Hook) -> Result<()> {
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        if slot.depth > 0 {
            slot.on_rollback.push(hook);
        }
        Ok(())
    }

    /// Commits at the outermost level and hands back the queued commit
    /// hooks, which the caller runs. Inner levels hand back nothing. A doomed
    /// transaction is rolled back instead and reported as failed.
    pub fn commit(&self, dialect: DialectKind, credentials: &Credentials) -> Result<Vec<Hook>> {
        let connector = self.connector(dialect, &credentials.database)?;
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        if slot.depth == 0 {
            return Err(NodecladError::InvalidArgument("commit without an open transaction".into()));
        }
        slot.depth -= 1;
        if slot.depth > 0 {
            return Ok(Vec::new());
        }
        let sql = dialect.dialect();
        let hooks = std::mem::take(&mut slot.on_commit);
        let pending = std::mem::take(&mut slot.on_rollback);
        if slot.doomed {
            slot.doomed = false;
            let rolled = slot.open(connector.as_ref()).and_then(|c| c.execute_batch(sql.rollback()));
            drop(slot);
            undo(pending);
            rolled?;
            return Err(NodecladError::query(
                sql.commit(),
                "an inner transaction failed, the whole transaction was rolled back",
            ));
        }
        let committed = slot.open(connector.as_ref()).and_then(|c| c.execute_batch(sql.commit()));
        drop(slot);
        match committed {
            Ok(()) => Ok(hooks),
            Err(e) => {
                undo(pending);
                Err(e)
            }
        }
    }

    /// Rolls back at the outermost level, running the queued undo work;
    /// dooms the enclosing transaction otherwise.
    pub fn rollback(&self, dialect: DialectKind, credentials: &Credentials) -> Result<()> {
        let connector = self.connector(dialect, &credentials.database)?;
        let slot = self.slot(dialect, credentials)?;
        let mut slot = slot.lock()?;
        if slot.depth == 0 {
            return Err(NodecladError::InvalidArgument("rollback without an open transaction".into()));
        }
        slot.depth -= 1;
        if slot.depth > 0 {
            slot.doomed = true;
            return Ok(());
        }
        slot.doomed = false;
        slot.on_commit.clear();
        let pending = std::mem::take(&mut slot.on_rollback);
        let rolled = slot.open(connector.as_ref()).and_then(|c| c.execute_batch(dialect.dialect().rollback()));
        drop(slot);
        undo(pending);
        rolled
    }

    /// Tries each registered connector in turn and returns the first dialect
    /// that accepts a connection. Failures are expected here and only logged.
    pub fn probe(&self, credentials: &Credentials) -> Option<DialectKind> {
        self.connectors.iter().find_map(|connector| match connector.connect(credentials) {
            Ok(_) => Some(connector.dialect()),
            Err(e) => {
                debug!(dialect = %connector.dialect(), error = %e, "probe failed");
                None
            }
        })
    }

    /// Drops every open connection.
    pub fn close(&self) -> Result<()> {
        let mut slots = self.slots.lock()?;
        for slot in slots.values() {
            let slot = slot.lock()?;
            if slot.depth > 0 {
                warn!(database = %slot.credentials.database, depth = slot.depth, "closing a connection inside a transaction");
            }
        }
        slots.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteConnector;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> ConnectionPool {
        let mut pool = ConnectionPool::new(Duration::ZERO);
        pool.register(Arc::new(SqliteConnector::in_memory()));
        pool
    }

    fn credentials() -> Credentials {
        Credentials { database: "scratch".into(), ..Default::default() }
    }

    #[test]
    fn inner_rollback_dooms_the_outer_commit() {
        let pool = pool();
        let creds = credentials();
        pool.run(DialectKind::Sqlite, &creds, |c| c.execute_batch("CREATE TABLE t (a INTEGER)")).unwrap();
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.run(DialectKind::Sqlite, &creds, |c| c.execute("INSERT INTO t VALUES (1)", &[])).unwrap();
        pool.rollback(DialectKind::Sqlite, &creds).unwrap();
        assert_eq!(pool.depth(DialectKind::Sqlite, &creds).unwrap(), 1);
        assert!(pool.commit(DialectKind::Sqlite, &creds).is_err());
        let rows = pool.run(DialectKind::Sqlite, &creds, |c| c.query("SELECT COUNT(*) FROM t", &[])).unwrap();
        assert_eq!(rows[0][0], Value::Int(0));
    }

    fn counting(counter: &Arc<AtomicUsize>, step: usize) -> Hook {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(step, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn commit_hooks_wait_for_the_outermost_level() {
        let pool = pool();
        let creds = credentials();
        let ran = Arc::new(AtomicUsize::new(0));
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.on_commit(DialectKind::Sqlite, &creds, counting(&ran, 1)).unwrap();
        assert!(pool.commit(DialectKind::Sqlite, &creds).unwrap().is_empty());
        let hooks = pool.commit(DialectKind::Sqlite, &creds).unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        for hook in hooks {
            hook().unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // outside a transaction a commit hook runs at once
        pool.on_commit(DialectKind::Sqlite, &creds, counting(&ran, 1)).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rollback_runs_undo_work_and_drops_commit_hooks() {
        let pool = pool();
        let creds = credentials();
        let ran = Arc::new(AtomicUsize::new(0));
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        pool.on_commit(DialectKind::Sqlite, &creds, counting(&ran, 100)).unwrap();
        pool.on_rollback(DialectKind::Sqlite, &creds, counting(&ran, 1)).unwrap();
        pool.rollback(DialectKind::Sqlite, &creds).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(pool.commit(DialectKind::Sqlite, &creds).is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        assert!(pool.commit(DialectKind::Sqlite, &creds).unwrap().is_empty());
    }

    #[test]
    fn dropped_connections_are_retried_once() {
        let pool = pool();
        let attempts = AtomicUsize::new(0);
        let result = pool.run(DialectKind::Sqlite, &credentials(), |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(NodecladError::query("SELECT 1", "server closed the connection unexpectedly"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_retry_inside_a_transaction() {
        let pool = pool();
        let creds = credentials();
        pool.begin(DialectKind::Sqlite, &creds).unwrap();
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = pool.run(DialectKind::Sqlite, &creds, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(NodecladError::query("SELECT 1", "lost connection to server"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        pool.rollback(DialectKind::Sqlite, &creds).unwrap();
    }

    #[test]
    fn missing_connector_fails_to_connect() {
        let pool = pool();
        let result = pool.run(DialectKind::MySql, &credentials(), |c| c.execute_batch("SELECT 1"));
        assert!(matches!(result, Err(NodecladError::DbConnectFailed { .. })));
    }
}
