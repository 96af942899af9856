use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// used for generated primary keys
use uuid::Uuid;

// used for logging
use tracing::{debug, error, info, warn};

// our own stuff that we need
use super::{Persistor, Session, elements};
use crate::archive::{Revision, VersionArchive};
use crate::assertion::Resolver;
use crate::config::SaveStrategy;
use crate::datatype;
use crate::driver::FlatfileStore;
use crate::entity::{CTIME, Entity, ID, MTIME, NAME};
use crate::error::{AssertFailed, AssertReason, NodecladError, Result};
use crate::node::Node;
use crate::pool::Hook;
use crate::search::SearchQuery;
use crate::stream::{Flow, Stream};
use crate::value::{Row, Value};

/// Access to the stored objects of one entity.
#[derive(Clone)]
pub struct Handle<'p> {
    persistor: &'p Persistor,
    entity: Arc<Entity>,
}

impl fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle").field("entity", &self.entity.name()).finish()
    }
}

impl<'p> Handle<'p> {
    pub(crate) fn new(persistor: &'p Persistor, entity: Arc<Entity>) -> Self {
        Self { persistor, entity }
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }
    pub fn persistor(&self) -> &'p Persistor {
        self.persistor
    }

    /// A new, unsaved node.
    pub fn create(&self) -> Node {
        Node::new(&self.entity)
    }

    pub(crate) fn session(&self) -> Session<'p> {
        self.persistor.session(&self.entity)
    }

    fn ensure(&self) -> Result<()> {
        self.persistor.provision(&self.entity)
    }

    fn store(&self) -> Option<FlatfileStore> {
        self.persistor.flatfile_store(&self.entity)
    }

    fn archive(&self) -> Option<&'p Arc<dyn VersionArchive>> {
        if self.entity.config().use_archive { self.persistor.archive() } else { None }
    }

    fn not_applicable(&self, method: &'static str, reason: &str) -> NodecladError {
        NodecladError::MethodNotApplicable {
            entity: self.entity.name().to_string(),
            method,
            reason: reason.to_string(),
        }
    }

    fn not_found(&self, key: impl fmt::Display) -> NodecladError {
        NodecladError::ObjectNotFound { entity: self.entity.name().to_string(), key: key.to_string() }
    }

    /// Brings a caller supplied key into the form of the primary key.
    fn key_of(&self, id: Value) -> Result<Value> {
        self.entity
            .pk_assertion()
            .kind()
            .from_storage(id)
            .map_err(|e| NodecladError::InvalidArgument(format!("bad key for {}: {e}", self.entity.name())))
    }

    fn encode(&self, session: &Session, column: &str, value: &Value) -> Value {
        match self.entity.attribute(column) {
            Some(assertion) => session.dialect.encode(assertion, value),
            None => value.clone(),
        }
    }

    // ------------- Loading -------------
    /// Loads the object stored under `id`, through the cache when the
    /// entity has a cache TTL.
    pub fn load(&self, id: impl Into<Value>) -> Result<Node> {
        let id = self.key_of(id.into())?;
        if id.is_null() {
            return Err(NodecladError::InvalidArgument(format!("cannot load {} without a key", self.entity.name())));
        }
        self.ensure()?;
        let key = id.to_string();
        if let Some(node) = self.cached(&key) {
            debug!(entity = %self.entity.name(), id = %key, "cache hit");
            return Ok(node);
        }
        let node = if self.entity.uses_db() { self.load_row(&id)? } else { self.load_file(&key)? };
        let node = node.ok_or_else(|| self.not_found(&key))?;
        if let Some(hook) = self.cache_hook(&node) {
            // a row read inside an open transaction is cached once it commits
            if self.entity.uses_db() { self.session().on_commit(hook)? } else { hook()? }
        }
        Ok(node)
    }

    fn load_row(&self, id: &Value) -> Result<Option<Node>> {
        let session = self.session();
        let pk = self.entity.primary_key();
        let sql = session.dialect.select_sql(&self.entity, &[pk]);
        let Some(row) = session.query(&sql, &[self.encode(&session, pk, id)])?.into_iter().next() else {
            return Ok(None);
        };
        let mut node = self.from_row(&session, row)?;
        let key = node.key().clone();
        for (attribute, element) in self.entity.elements() {
            let members = elements::load(&session, element, &key)?;
            let optional = self.entity.attribute(attribute).is_some_and(|a| a.is_optional());
            if members.size() == 0 && optional {
                node.restore(attribute, Value::Null);
            } else {
                node.restore(attribute, members);
            }
        }
        Ok(Some(node))
    }

    fn from_row(&self, session: &Session, row: Row) -> Result<Node> {
        let mut node = Node::new(&self.entity);
        for (column, raw) in self.entity.select_columns().into_iter().zip(row) {
            let value = match self.entity.attribute(column) {
                Some(assertion) => session.dialect.decode(assertion, raw).map_err(|e| {
                    NodecladError::DataConversionFailed(format!("{}.{column}: {e}", self.entity.name()))
                })?,
                None => raw,
            };
            node.restore(column, value);
        }
        Ok(node)
    }

    fn load_file(&self, key: &str) -> Result<Option<Node>> {
        let Some(store) = self.store() else {
            return Ok(None);
        };
        store.read(key)?.map(|document| Node::from_document(&self.entity, &document)).transpose()
    }

    pub fn load_by_name(&self, name: &str) -> Result<Node> {
        let key = self.key_by_name(name)?.ok_or_else(|| self.not_found(name))?;
        self.load(key)
    }

    /// The object called `name`, or a new unsaved one carrying that name.
    pub fn spawn(&self, name: &str) -> Result<Node> {
        match self.key_by_name(name)? {
            Some(key) => self.load(key),
            None => self.create().with(NAME, name),
        }
    }

    fn key_by_name(&self, name: &str) -> Result<Option<Value>> {
        if !self.entity.has_name() {
            return Err(self.not_applicable("load_by_name", "the entity has no name attribute"));
        }
        self.ensure()?;
        if self.entity.uses_db() {
            let session = self.session();
            let dialect = session.dialect;
            let pk = self.entity.primary_key();
            let sql = format!(
                "SELECT {} FROM {}{}",
                dialect.quote_ident(pk),
                dialect.table_ref(&self.entity),
                dialect.where_clause(&[NAME], 1)
            );
            let rows = session.query(&sql, &[Value::from(name)])?;
            return match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
                Some(raw) => Ok(Some(self.key_of(raw)?)),
                None => Ok(None),
            };
        }
        Ok(self.scan_files(|node| node.name() == Some(name))?.map(|node| node.key().clone()))
    }

    /// First flatfile object satisfying `matches`.
    fn scan_files<F>(&self, mut matches: F) -> Result<Option<Node>>
    where
        F: FnMut(&Node) -> bool,
    {
        let Some(store) = self.store() else {
            return Ok(None);
        };
        for id in store.ids()? {
            if let Some(document) = store.read(&id)? {
                let node = Node::from_document(&self.entity, &document)?;
                if matches(&node) {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    pub fn load_json(&self, id: impl Into<Value>) -> Result<String> {
        self.load(id)?.to_json()
    }
    pub fn load_yaml(&self, id: impl Into<Value>) -> Result<String> {
        self.load(id)?.to_yaml()
    }

    // ------------- Saving -------------
    /// Validates and stores `node`. A first save assigns the key and
    /// `ctime`; every save refreshes `mtime`. On failure the node gets its
    /// previous key and timestamps back.
    pub fn save(&self, node: &mut Node, comment: Option<&str>) -> Result<()> {
        if node.entity().name() != self.entity.name() {
            return Err(NodecladError::InvalidArgument(format!(
                "cannot save a {} through the {} handle",
                node.entity().name(),
                self.entity.name()
            )));
        }
        self.ensure()?;
        let mut snapshot: Vec<(String, Value)> = Vec::new();
        for attribute in [self.entity.primary_key(), ID, CTIME, MTIME] {
            snapshot.push((attribute.to_string(), node.get(attribute).clone()));
        }
        let published = match self.store_node(node, comment) {
            Ok(published) => published,
            Err(e) => {
                for (attribute, value) in snapshot {
                    node.restore(&attribute, value);
                }
                return Err(e);
            }
        };
        follow_up(published)?;
        debug!(entity = %self.entity.name(), id = ?node.id(), "saved");
        Ok(())
    }

    /// Writes `node` and returns the cache and search updates that are due
    /// now. Inside an enclosing transaction they wait for its commit.
    fn store_node(&self, node: &mut Node, comment: Option<&str>) -> Result<Vec<Hook>> {
        let serial = self.entity.has_serial_key();
        let pk = self.entity.primary_key();
        if node.get(ID).is_null() && !(serial && pk == ID) {
            node.restore(ID, Value::Text(Uuid::new_v4().to_string()));
        }
        if node.key().is_null() && !serial {
            return Err(NodecladError::PrimaryKeyMissing { entity: self.entity.name().to_string() });
        }
        let now = datatype::now();
        if node.get(CTIME).is_null() {
            node.restore(CTIME, Value::Time(now));
        }
        node.restore(MTIME, Value::Time(now));

        node.validate_with(self)?;
        self.check_unique(node)?;
        self.check_master_host()?;

        if !self.entity.uses_db() {
            let Some(store) = self.store() else {
                return Err(self.not_applicable("save", "the entity has no backing store"));
            };
            self.write_file(&store, node, comment)?;
            return Ok(self.published(node));
        }
        let session = self.session();
        session.begin()?;
        match self.stage(&session, node, comment) {
            Ok(()) => session.commit().map_err(|cause| self.failed(cause)),
            Err(cause) => Err(self.abort(&session, cause)),
        }
    }

    fn stage(&self, session: &Session, node: &mut Node, comment: Option<&str>) -> Result<()> {
        self.write_rows(session, node)?;
        if let Some(store) = self.store() {
            self.stage_file(session, &store, node, comment)?;
        }
        for hook in self.published(node) {
            session.on_commit(hook)?;
        }
        Ok(())
    }

    fn write_rows(&self, session: &Session, node: &mut Node) -> Result<()> {
        let entity = &*self.entity;
        let dialect = session.dialect;
        if entity.has_serial_key() && node.key().is_null() {
            let (sql, bound) = dialect.insert_sql(entity);
            let params = session.params(entity, &bound, node.values());
            let fallback = dialect.last_insert_id_sql(entity);
            let generated = session.run(|c| {
                c.execute(&sql, &params)?;
                match (c.last_insert_id()?, &fallback) {
                    (Some(id), _) => Ok(Some(id)),
                    (None, Some(query)) => {
                        Ok(c.query(query, &[])?.first().and_then(|row| row.first()).and_then(Value::as_i64))
                    }
                    (None, None) => Ok(None),
                }
            })?;
            let id = generated.ok_or_else(|| NodecladError::query(&sql, "the store reported no generated key"))?;
            node.restore(entity.primary_key(), Value::Int(id));
        } else if entity.config().save_strategy == SaveStrategy::NativeUpsert {
            let (sql, bound) = dialect.upsert_sql(entity);
            session.execute(&sql, &session.params(entity, &bound, node.values()))?;
        } else {
            let (sql, bound) = dialect.update_sql(entity);
            if session.execute(&sql, &session.params(entity, &bound, node.values()))? == 0 {
                if entity.has_serial_key() {
                    // serial keys only come from the store, so the row is gone
                    return Err(self.not_found(node.key()));
                }
                let (sql, bound) = dialect.insert_sql(entity);
                session.execute(&sql, &session.params(entity, &bound, node.values()))?;
            }
        }
        let key = node.key().clone();
        for (attribute, element) in entity.elements() {
            elements::save(session, element, &key, node.get(attribute))?;
        }
        Ok(())
    }

    fn file_key(&self, node: &Node) -> Result<String> {
        node.id().ok_or_else(|| NodecladError::ObjectIsAnonymous {
            entity: self.entity.name().to_string(),
            action: "written to a file",
        })
    }

    fn write_file(&self, store: &FlatfileStore, node: &Node, comment: Option<&str>) -> Result<()> {
        let key = self.file_key(node)?;
        let path = store.path(&key);
        let archive = self.archive();
        if let Some(archive) = archive {
            archive.checkout(&path)?;
        }
        store.write(&key, &node.to_document())?;
        if let Some(archive) = archive {
            let revision = archive.checkin(&path, comment.unwrap_or_default())?;
            debug!(entity = %self.entity.name(), id = %key, revision = ?revision, "archived");
        }
        Ok(())
    }

    /// Writes the document of `node` inside the open transaction. A rollback
    /// puts the previous document back and releases the archive lock; the
    /// checkin waits for the commit.
    fn stage_file(&self, session: &Session, store: &FlatfileStore, node: &Node, comment: Option<&str>) -> Result<()> {
        let key = self.file_key(node)?;
        let path = store.path(&key);
        let previous = store.read(&key)?;
        let archive = self.archive().cloned();
        if let Some(archive) = &archive {
            archive.checkout(&path)?;
        }
        let undo: Hook = {
            let (store, key, path, archive) = (store.clone(), key.clone(), path.clone(), archive.clone());
            Box::new(move || {
                match &previous {
                    Some(document) => {
                        store.write(&key, document)?;
                    }
                    None => {
                        store.remove(&key)?;
                    }
                }
                archive.map_or(Ok(()), |archive| archive.release(&path))
            })
        };
        session.on_rollback(undo)?;
        store.write(&key, &node.to_document())?;
        if let Some(archive) = archive {
            let comment = comment.unwrap_or_default().to_string();
            let entity = self.entity.name().to_string();
            session.on_commit(Box::new(move || {
                let revision = archive.checkin(&path, &comment)?;
                debug!(entity = %entity, id = %key, revision = ?revision, "archived");
                Ok(())
            }))?;
        }
        Ok(())
    }

    fn failed(&self, cause: NodecladError) -> NodecladError {
        NodecladError::TransactionFailed { entity: self.entity.name().to_string(), cause: Box::new(cause) }
    }

    /// Rolls back after `cause` and reports how that went.
    fn abort(&self, session: &Session, cause: NodecladError) -> NodecladError {
        match session.rollback() {
            Ok(()) => {
                warn!(entity = %self.entity.name(), error = %cause, "transaction rolled back");
                self.failed(cause)
            }
            Err(rollback) => {
                error!(
                    entity = %self.entity.name(),
                    error = %cause,
                    rollback = %rollback,
                    "rollback failed, stored data may be inconsistent"
                );
                NodecladError::RollbackFailed {
                    entity: self.entity.name().to_string(),
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    /// Rejects values another object already holds in a unique column group.
    /// Groups with a null member are not checked.
    fn check_unique(&self, node: &Node) -> Result<()> {
        let own_key = node.id();
        for group in self.entity.unique_groups() {
            if group.iter().any(|column| node.get(column).is_null()) {
                continue;
            }
            let clash = if self.entity.uses_db() {
                let session = self.session();
                let dialect = session.dialect;
                let columns: Vec<&str> = group.iter().map(String::as_str).collect();
                let sql = format!(
                    "SELECT {} FROM {}{}",
                    dialect.quote_ident(self.entity.primary_key()),
                    dialect.table_ref(&self.entity),
                    dialect.where_clause(&columns, 1)
                );
                let params: Vec<Value> =
                    group.iter().map(|column| self.encode(&session, column, node.get(column))).collect();
                session
                    .query(&sql, &params)?
                    .into_iter()
                    .filter_map(|row| row.into_iter().next())
                    .any(|key| Some(key.to_string()) != own_key)
            } else {
                self.scan_files(|other| {
                    other.id() != own_key && group.iter().all(|column| other.get(column) == node.get(column))
                })?
                .is_some()
            };
            if clash {
                let first = group[0].clone();
                let reason = AssertReason::NotUnique { columns: group };
                return Err(AssertFailed::new(&first, node.get(&first), reason).into());
            }
        }
        Ok(())
    }

    fn check_master_host(&self) -> Result<()> {
        if !self.entity.uses_flatfile() {
            return Ok(());
        }
        let settings = self.persistor.settings();
        let master = self
            .entity
            .config()
            .flatfile_master_host
            .clone()
            .or_else(|| settings.flatfile_master_host.clone());
        match master {
            Some(expected) => {
                let actual = settings.hostname();
                if expected == actual { Ok(()) } else { Err(NodecladError::WrongHost { expected, actual }) }
            }
            None => Ok(()),
        }
    }

    // ------------- Removing -------------
    /// Removes the stored object of `node`. Archived revisions stay behind.
    pub fn remove(&self, node: &Node, reason: Option<&str>) -> Result<()> {
        if node.key().is_null() {
            return Err(NodecladError::ObjectIsAnonymous {
                entity: self.entity.name().to_string(),
                action: "removed",
            });
        }
        self.remove_id(node.key().clone(), reason)
    }

    pub fn remove_id(&self, id: impl Into<Value>, reason: Option<&str>) -> Result<()> {
        let id = self.key_of(id.into())?;
        if id.is_null() {
            return Err(NodecladError::ObjectIsAnonymous {
                entity: self.entity.name().to_string(),
                action: "removed",
            });
        }
        self.ensure()?;
        self.check_master_host()?;
        let key = id.to_string();
        let found = if self.entity.uses_db() {
            let session = self.session();
            session.begin()?;
            match self.stage_removal(&session, &id, &key) {
                Ok(found) => {
                    follow_up(session.commit().map_err(|cause| self.failed(cause))?)?;
                    found
                }
                Err(cause) => return Err(self.abort(&session, cause)),
            }
        } else {
            let found = self.unlink(&key)?;
            follow_up(self.purged(&key))?;
            found
        };
        if !found {
            return Err(self.not_found(&key));
        }
        info!(entity = %self.entity.name(), id = %key, reason = reason.unwrap_or_default(), "removed");
        Ok(())
    }

    fn delete_rows(&self, session: &Session, id: &Value) -> Result<bool> {
        for (_, element) in self.entity.elements() {
            elements::delete(session, element, id)?;
        }
        let pk = self.entity.primary_key();
        let sql = session.dialect.delete_sql(&self.entity, pk);
        Ok(session.execute(&sql, &[self.encode(session, pk, id)])? > 0)
    }

    fn stage_removal(&self, session: &Session, id: &Value, key: &str) -> Result<bool> {
        let found = self.delete_rows(session, id)?;
        let unlinked = self.stage_unlink(session, key)?;
        for hook in self.purged(key) {
            session.on_commit(hook)?;
        }
        Ok(found || unlinked)
    }

    /// Unlinks the document of `key` inside the open transaction; a rollback
    /// writes it back.
    fn stage_unlink(&self, session: &Session, key: &str) -> Result<bool> {
        let Some(store) = self.store() else {
            return Ok(false);
        };
        let Some(previous) = store.read(key)? else {
            return Ok(false);
        };
        let undo: Hook = {
            let (store, key) = (store.clone(), key.to_string());
            Box::new(move || store.write(&key, &previous).map(drop))
        };
        session.on_rollback(undo)?;
        store.remove(key)
    }

    fn unlink(&self, key: &str) -> Result<bool> {
        match self.store() {
            Some(store) => store.remove(key),
            None => Ok(false),
        }
    }

    // ------------- Archive -------------
    fn archived_path(&self, method: &'static str, id: Value) -> Result<(FlatfileStore, &'p Arc<dyn VersionArchive>, String)> {
        let (Some(store), Some(archive)) = (self.store(), self.archive()) else {
            return Err(self.not_applicable(method, "the entity keeps no archived flatfiles"));
        };
        let key = self.key_of(id)?.to_string();
        Ok((store, archive, key))
    }

    /// Rebuilds `node` from an archived revision, the latest when `version`
    /// is `None`. Nothing is saved.
    pub fn revert(&self, node: &Node, version: Option<u32>) -> Result<Node> {
        if node.key().is_null() {
            return Err(NodecladError::ObjectIsAnonymous {
                entity: self.entity.name().to_string(),
                action: "reverted",
            });
        }
        self.restore(node.key().clone(), version)
    }

    /// Like [`Handle::revert`], by key. Works after the object was removed.
    pub fn restore(&self, id: impl Into<Value>, version: Option<u32>) -> Result<Node> {
        let (store, archive, key) = self.archived_path("restore", id.into())?;
        let text = archive.fetch(&store.path(&key), version)?.ok_or_else(|| match version {
            Some(version) => self.not_found(format!("{key} revision {version}")),
            None => self.not_found(&key),
        })?;
        Node::from_document(&self.entity, &store.format().decode(&text)?)
    }

    pub fn revisions(&self, id: impl Into<Value>) -> Result<Vec<u32>> {
        let (store, archive, key) = self.archived_path("revisions", id.into())?;
        archive.revisions(&store.path(&key))
    }
    pub fn head(&self, id: impl Into<Value>) -> Result<Option<u32>> {
        let (store, archive, key) = self.archived_path("head", id.into())?;
        archive.head(&store.path(&key))
    }
    pub fn log(&self, id: impl Into<Value>) -> Result<Vec<Revision>> {
        let (store, archive, key) = self.archived_path("log", id.into())?;
        archive.log(&store.path(&key))
    }

    // ------------- Enumeration -------------
    /// Every stored key, in key order.
    pub fn all_ids(&self) -> Result<Vec<Value>> {
        self.ensure()?;
        if self.entity.uses_db() {
            let session = self.session();
            let dialect = session.dialect;
            let pk = dialect.quote_ident(self.entity.primary_key());
            let sql = format!("SELECT {pk} FROM {} ORDER BY {pk}", dialect.table_ref(&self.entity));
            return session
                .query(&sql, &[])?
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .map(|raw| self.key_of(raw))
                .collect();
        }
        match self.store() {
            Some(store) => store.ids()?.into_iter().map(|id| self.key_of(Value::Text(id))).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Every non-null name, sorted. Only SQL stores can answer this.
    pub fn all_names(&self) -> Result<Vec<String>> {
        if !self.entity.uses_db() {
            return Err(self.not_applicable("all_names", "only SQL stores list names"));
        }
        if !self.entity.has_name() {
            return Err(self.not_applicable("all_names", "the entity has no name attribute"));
        }
        self.ensure()?;
        let session = self.session();
        let dialect = session.dialect;
        let name = dialect.quote_ident(NAME);
        let sql = format!(
            "SELECT {name} FROM {} WHERE {name} IS NOT NULL ORDER BY {name}",
            dialect.table_ref(&self.entity)
        );
        Ok(session
            .query(&sql, &[])?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|name| name.to_string())
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure()?;
        if self.entity.uses_db() {
            let session = self.session();
            let sql = format!("SELECT COUNT(*) FROM {}", session.dialect.table_ref(&self.entity));
            let count = session.query(&sql, &[])?.first().and_then(|row| row.first()).and_then(Value::as_i64);
            return Ok(count.unwrap_or(0).max(0) as usize);
        }
        Ok(self.store().map(|store| store.ids()).transpose()?.map_or(0, |ids| ids.len()))
    }

    /// Applies `visit` to every stored object in key order. Keys are read
    /// up front; objects are loaded one at a time.
    pub fn each<T, F>(&self, mut visit: F) -> Result<Vec<T>>
    where
        F: FnMut(&Node) -> Flow<T>,
    {
        let mut collected = Vec::new();
        for id in self.all_ids()? {
            match visit(&self.load(id)?) {
                Flow::Continue(values) => collected.extend(values),
                Flow::Skip => {}
                Flow::Stop(values) => {
                    collected.extend(values);
                    break;
                }
            }
        }
        Ok(collected)
    }

    pub fn stream(&self) -> Result<Stream<'p>> {
        Stream::new(self)
    }

    pub fn does_id_exist(&self, id: impl Into<Value>) -> Result<bool> {
        let id = self.key_of(id.into())?;
        if id.is_null() {
            return Ok(false);
        }
        self.ensure()?;
        if self.entity.uses_db() {
            let session = self.session();
            let dialect = session.dialect;
            let pk = self.entity.primary_key();
            let sql = format!("SELECT 1 FROM {}{}", dialect.table_ref(&self.entity), dialect.where_clause(&[pk], 1));
            return Ok(!session.query(&sql, &[self.encode(&session, pk, &id)])?.is_empty());
        }
        Ok(self.store().is_some_and(|store| store.exists(&id.to_string())))
    }

    pub fn does_name_exist(&self, name: &str) -> Result<bool> {
        if !self.entity.has_name() {
            return Ok(false);
        }
        Ok(self.key_by_name(name)?.is_some())
    }

    // ------------- Search -------------
    /// Keys of objects matching the query text. Empty when the entity has
    /// no indexed attributes.
    pub fn search(&self, text: &str) -> Result<Vec<String>> {
        self.run_search(&SearchQuery::parse(text)?)
    }

    /// Keys of objects whose fields contain all the given terms.
    pub fn search_fields(&self, fields: &BTreeMap<String, String>) -> Result<Vec<String>> {
        self.run_search(&SearchQuery::fields(fields))
    }

    fn run_search(&self, query: &SearchQuery) -> Result<Vec<String>> {
        if self.entity.indexed_attributes().is_empty() {
            return Ok(Vec::new());
        }
        let Some(index) = self.persistor.index() else {
            return Err(self.not_applicable("search", "no search index is configured"));
        };
        self.ensure()?;
        index.search(self.entity.name(), query)
    }

    // ------------- Cache -------------
    fn cache_ttl(&self) -> Option<Duration> {
        self.entity.config().cache_ttl.or_else(|| {
            self.persistor.settings().cache.default_ttl_secs.map(Duration::from_secs)
        })
    }

    fn cached(&self, key: &str) -> Option<Node> {
        let (Some(cache), Some(_)) = (self.persistor.cache(), self.cache_ttl()) else {
            return None;
        };
        let found = cache.get(&self.entity.cache_key(key)).and_then(|bytes| {
            bytes
                .map(|bytes| {
                    let text = String::from_utf8(bytes).map_err(|e| NodecladError::Cache(e.to_string()))?;
                    Node::from_json(&self.entity, &text)
                })
                .transpose()
        });
        match found {
            Ok(node) => node,
            Err(e) => {
                warn!(entity = %self.entity.name(), id = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    /// Cache and search updates that follow a stored `node`.
    fn published(&self, node: &Node) -> Vec<Hook> {
        let mut hooks: Vec<Hook> = self.cache_hook(node).into_iter().collect();
        let Some(key) = node.id() else {
            return hooks;
        };
        let indexed = self.entity.indexed_attributes();
        if let Some(index) = self.persistor.index().cloned().filter(|_| !indexed.is_empty()) {
            let fields: BTreeMap<String, String> = indexed
                .into_iter()
                .filter(|attribute| !node.get(attribute).is_null())
                .map(|attribute| (attribute.to_string(), node.get(attribute).to_string()))
                .collect();
            let collection = self.entity.name().to_string();
            hooks.push(Box::new(move || index.add(&collection, &key, &fields)));
        }
        hooks
    }

    fn cache_hook(&self, node: &Node) -> Option<Hook> {
        let (Some(cache), Some(ttl), Some(key)) = (self.persistor.cache().cloned(), self.cache_ttl(), node.id()) else {
            return None;
        };
        let json = match node.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(entity = %self.entity.name(), id = %key, error = %e, "cache write failed");
                return None;
            }
        };
        let (entity, cache_key) = (self.entity.name().to_string(), self.entity.cache_key(&key));
        let hook: Hook = Box::new(move || {
            if let Err(e) = cache.set(&cache_key, json.into_bytes(), ttl) {
                warn!(entity = %entity, key = %cache_key, error = %e, "cache write failed");
            }
            Ok(())
        });
        Some(hook)
    }

    /// Cache and search purges that follow a removal of `key`.
    fn purged(&self, key: &str) -> Vec<Hook> {
        let mut hooks: Vec<Hook> = Vec::new();
        if let Some(cache) = self.persistor.cache().cloned() {
            let (entity, cache_key) = (self.entity.name().to_string(), self.entity.cache_key(key));
            hooks.push(Box::new(move || {
                if let Err(e) = cache.delete(&cache_key) {
                    warn!(entity = %entity, key = %cache_key, error = %e, "cache purge failed");
                }
                Ok(())
            }));
        }
        let indexed = !self.entity.indexed_attributes().is_empty();
        if let Some(index) = self.persistor.index().cloned().filter(|_| indexed) {
            let (collection, key) = (self.entity.name().to_string(), key.to_string());
            hooks.push(Box::new(move || index.remove(&collection, &key)));
        }
        hooks
    }

    // ------------- References -------------
    /// Handle of the entity `attribute` refers to, also through arrays and
    /// hashes of references.
    pub fn member_class(&self, attribute: &str) -> Result<Handle<'p>> {
        let assertion = self.entity.attribute(attribute).ok_or_else(|| {
            NodecladError::InvalidArgument(format!("{} has no attribute '{attribute}'", self.entity.name()))
        })?;
        let class = assertion
            .member_class()
            .ok_or_else(|| self.not_applicable("member_class", &format!("{attribute} is not a reference")))?;
        self.persistor.handle(class)
    }

    // ------------- SQL -------------
    /// `CREATE TABLE` statements of the entity and its element entities.
    pub fn schema_ddl(&self) -> Result<Vec<String>> {
        if !self.entity.uses_db() {
            return Err(self.not_applicable("schema_ddl", "the entity is not stored in SQL"));
        }
        Ok(self.persistor.schema(&self.entity))
    }

    /// Runs `work` inside one transaction on this entity's database. Saves
    /// and removes made inside join it; a failure in any of them rolls
    /// everything back.
    pub fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        if !self.entity.uses_db() {
            return work(self);
        }
        self.ensure()?;
        let session = self.session();
        session.begin()?;
        match work(self) {
            Ok(value) => {
                follow_up(session.commit().map_err(|cause| self.failed(cause))?)?;
                Ok(value)
            }
            Err(cause) => Err(self.abort(&session, cause)),
        }
    }

    fn sql_only(&self, method: &'static str) -> Result<Session<'p>> {
        if !self.entity.uses_db() {
            return Err(self.not_applicable(method, "the entity is not stored in SQL"));
        }
        self.ensure()?;
        Ok(self.session())
    }

    /// First column of the first row, null when there is none.
    pub fn select_scalar(&self, sql: &str, params: &[Value]) -> Result<Value> {
        let rows = self.sql_only("select_scalar")?.query(sql, params)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()).unwrap_or(Value::Null))
    }
    pub fn select_multi(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.sql_only("select_multi")?.query(sql, params)
    }
    /// Executes a statement and returns the number of affected rows.
    pub fn write(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.sql_only("write")?.execute(sql, params)
    }
}

/// Runs the work a commit handed back, in order.
fn follow_up(hooks: Vec<Hook>) -> Result<()> {
    hooks.into_iter().try_for_each(|hook| hook())
}

impl Resolver for Handle<'_> {
    fn exists(&self, entity: &str, id: &Value) -> Result<bool> {
        self.persistor.handle(entity)?.does_id_exist(id.clone())
    }
    fn allowed_values(&self, sql: &str) -> Result<Vec<Value>> {
        Ok(self
            .select_multi(sql, &[])?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }
}
