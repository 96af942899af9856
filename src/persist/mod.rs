//! The persistence engine.
//!
//! A [`Persistor`] owns the entity registry, the connection pool and the
//! optional collaborators (object cache, search index, version archive).
//! Declaring an entity hands back a [`Handle`], through which objects of
//! that entity are loaded, saved and removed.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::archive::{DirectoryArchive, VersionArchive};
use crate::cache::{Cache, MemoryCache};
use crate::config::{Credentials, Settings};
use crate::driver::{Connection, Connector, Dialect, DialectKind, FlatfileStore, SqliteConnector};
use crate::entity::{Entity, EntityBuilder, NameHasher, Registry};
use crate::error::Result;
use crate::pool::Hook;
use crate::search::{MemoryIndex, SearchIndex};
use crate::value::{Row, Value};

mod elements;
mod handle;

pub use handle::Handle;

// ------------- Persistor -------------
pub struct Persistor {
    settings: Settings,
    registry: Registry,
    pool: crate::pool::ConnectionPool,
    cache: Option<Arc<dyn Cache>>,
    index: Option<Arc<dyn SearchIndex>>,
    archive: Option<Arc<dyn VersionArchive>>,
    provisioned: Mutex<HashSet<String, NameHasher>>,
}

impl Persistor {
    pub fn builder(settings: Settings) -> PersistorBuilder {
        PersistorBuilder::new(settings)
    }

    /// SQLite databases in memory plus the in-process cache, search index
    /// and directory archive.
    pub fn in_memory(settings: Settings) -> Self {
        Self::builder(settings)
            .connector(Arc::new(SqliteConnector::in_memory()))
            .cache(Arc::new(MemoryCache::new()))
            .search_index(Arc::new(MemoryIndex::new()))
            .build()
    }

    /// Like [`Persistor::in_memory`], with SQLite files under the configured
    /// SQLite root.
    pub fn on_disk(settings: Settings) -> Self {
        let connector = SqliteConnector::on_disk(settings.sqlite_root());
        Self::builder(settings)
            .connector(Arc::new(connector))
            .cache(Arc::new(MemoryCache::new()))
            .search_index(Arc::new(MemoryIndex::new()))
            .build()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Declares an entity and returns its handle.
    pub fn declare(&self, builder: EntityBuilder) -> Result<Handle<'_>> {
        let entity = self.registry.declare(builder)?;
        debug!(entity = %entity, "declared");
        Ok(Handle::new(self, entity))
    }

    /// Handle of an already declared entity or one of its element entities.
    pub fn handle(&self, name: &str) -> Result<Handle<'_>> {
        Ok(Handle::new(self, self.registry.require(name)?))
    }

    /// The first registered dialect that accepts a connection with the
    /// configured login.
    pub fn probe(&self) -> Option<DialectKind> {
        let database = self.settings.db.database.clone().unwrap_or_default();
        self.pool.probe(&self.settings.credentials(&database, &Default::default()))
    }

    /// Drops every pooled connection. They reopen on next use, and tables
    /// are provisioned again since an in-memory database comes back empty.
    pub fn close(&self) -> Result<()> {
        self.provisioned.lock()?.clear();
        self.pool.close()
    }

    pub(crate) fn session(&self, entity: &Entity) -> Session<'_> {
        let kind = entity.config().dialect;
        Session {
            persistor: self,
            kind,
            dialect: kind.dialect(),
            credentials: self.settings.credentials(entity.database(), &entity.config().credentials),
        }
    }

    pub(crate) fn flatfile_store(&self, entity: &Entity) -> Option<FlatfileStore> {
        let format = entity.config().flatfile?;
        let root = entity.config().flatfile_root.as_deref().unwrap_or(self.settings.flatfile_root.as_path());
        Some(FlatfileStore::for_entity(root, entity, format))
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }
    pub(crate) fn index(&self) -> Option<&Arc<dyn SearchIndex>> {
        self.index.as_ref()
    }
    pub(crate) fn archive(&self) -> Option<&Arc<dyn VersionArchive>> {
        self.archive.as_ref()
    }

    /// Creates the tables of `entity` and its element entities, and the
    /// search collection of its indexed attributes, once per process.
    pub(crate) fn provision(&self, entity: &Arc<Entity>) -> Result<()> {
        if self.provisioned.lock()?.contains(entity.name()) {
            return Ok(());
        }
        if entity.uses_db() {
            let session = self.session(entity);
            for statement in self.schema(entity) {
                session.run(|c| c.execute_batch(&statement))?;
            }
            info!(entity = %entity.name(), dialect = %session.kind, "tables provisioned");
        }
        let indexed = entity.indexed_attributes();
        if let Some(index) = &self.index {
            if !indexed.is_empty() {
                index.provision(entity.name(), &indexed)?;
                info!(entity = %entity.name(), fields = ?indexed, "search collection provisioned");
            }
        }
        self.provisioned.lock()?.insert(entity.name().to_string());
        Ok(())
    }

    /// DDL of `entity` followed by that of its element entities, parents first.
    pub(crate) fn schema(&self, entity: &Entity) -> Vec<String> {
        let dialect = entity.config().dialect.dialect();
        let mut statements = vec![dialect.schema_ddl(entity, &self.registry)];
        for (_, element) in entity.elements() {
            statements.extend(self.schema(element));
        }
        statements
    }
}

// ------------- Builder -------------
pub struct PersistorBuilder {
    settings: Settings,
    connectors: Vec<Arc<dyn Connector>>,
    cache: Option<Arc<dyn Cache>>,
    index: Option<Arc<dyn SearchIndex>>,
    archive: Option<Arc<dyn VersionArchive>>,
}

impl PersistorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self { settings, connectors: Vec::new(), cache: None, index: None, archive: None }
    }
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push(connector);
        self
    }
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }
    pub fn search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }
    /// Replaces the directory archive used by entities declared `with_archive`.
    pub fn archive(mut self, archive: Arc<dyn VersionArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn build(self) -> Persistor {
        let mut pool = crate::pool::ConnectionPool::new(self.settings.reconnect_delay());
        for connector in self.connectors {
            pool.register(connector);
        }
        let archive = self.archive.unwrap_or_else(|| {
            Arc::new(DirectoryArchive::new(&self.settings.archive.dir_name, &self.settings.hostname()))
        });
        Persistor {
            registry: Registry::new(),
            pool,
            cache: self.cache,
            index: self.index,
            archive: Some(archive),
            provisioned: Mutex::new(HashSet::default()),
            settings: self.settings,
        }
    }
}

// ------------- Session -------------
/// The connection and dialect of one entity's database.
pub(crate) struct Session<'p> {
    persistor: &'p Persistor,
    pub(crate) kind: DialectKind,
    pub(crate) dialect: &'static dyn Dialect,
    credentials: Credentials,
}

impl Session<'_> {
    pub(crate) fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        self.persistor.pool.run(self.kind, &self.credentials, work)
    }
    pub(crate) fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run(|c| c.query(sql, params))
    }
    pub(crate) fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.run(|c| c.execute(sql, params))
    }
    /// Encodes `values` for the bound `columns` of a statement on `entity`.
    pub(crate) fn params(&self, entity: &Entity, columns: &[String], values: &BTreeMap<String, Value>) -> Vec<Value> {
        let null = Value::Null;
        columns
            .iter()
            .map(|column| {
                let value = values.get(column).unwrap_or(&null);
                match entity.attribute(column) {
                    Some(assertion) => self.dialect.encode(assertion, value),
                    None => value.clone(),
                }
            })
            .collect()
    }
    pub(crate) fn begin(&self) -> Result<()> {
        self.persistor.pool.begin(self.kind, &self.credentials)
    }
    /// Commits, handing back the follow-up work once the outermost level
    /// is durable.
    pub(crate) fn commit(&self) -> Result<Vec<Hook>> {
        self.persistor.pool.commit(self.kind, &self.credentials)
    }
    pub(crate) fn on_commit(&self, hook: Hook) -> Result<()> {
        self.persistor.pool.on_commit(self.kind, &self.credentials, hook)
    }
    pub(crate) fn on_rollback(&self, hook: Hook) -> Result<()> {
        self.persistor.pool.on_rollback(self.kind, &self.credentials, hook)
    }
    pub(crate) fn rollback(&self) -> Result<()> {
        self.persistor.pool.rollback(self.kind, &self.credentials)
    }
}
