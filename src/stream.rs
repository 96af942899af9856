//! Chunked iteration over query results.
//!
//! A [`Stream`] runs its query one `LIMIT`/`OFFSET` window at a time. The
//! total is counted once, before the first window; rows inserted or removed
//! while a stream is running can shift later windows.

use std::collections::VecDeque;

use tracing::debug;

use crate::entity::NAME;
use crate::error::{NodecladError, Result};
use crate::persist::{Handle, Session};
use crate::value::{Row, Value};

pub const DEFAULT_LIMIT: usize = 50;

/// What a visitor wants done after seeing one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    /// Keep going, collecting these values.
    Continue(Vec<T>),
    /// Keep going, collecting nothing.
    Skip,
    /// Collect these values and stop.
    Stop(Vec<T>),
}

impl<T> Flow<T> {
    pub fn emit(value: T) -> Self {
        Self::Continue(vec![value])
    }
}

pub struct Stream<'p> {
    handle: Handle<'p>,
    query: String,
    params: Vec<Value>,
    limit: usize,
    offset: usize,
    total: Option<usize>,
    buffer: VecDeque<Row>,
    fetches: usize,
    done: bool,
}

impl<'p> Stream<'p> {
    /// A stream over the keys (and names, when the entity has them) of the
    /// stored objects, ordered by name.
    pub fn new(handle: &Handle<'p>) -> Result<Self> {
        let entity = handle.entity();
        if !entity.uses_db() {
            return Err(NodecladError::MethodNotApplicable {
                entity: entity.name().to_string(),
                method: "stream",
                reason: "only SQL stores can be streamed".to_string(),
            });
        }
        let dialect = entity.config().dialect.dialect();
        let pk = dialect.quote_ident(entity.primary_key());
        let table = dialect.table_ref(entity);
        let query = if entity.has_name() {
            let name = dialect.quote_ident(NAME);
            format!("SELECT {pk}, {name} FROM {table} ORDER BY {name}, {pk}")
        } else {
            format!("SELECT {pk} FROM {table} ORDER BY {pk}")
        };
        Ok(Self {
            handle: handle.clone(),
            query,
            params: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            total: None,
            buffer: VecDeque::new(),
            fetches: 0,
            done: false,
        })
    }

    /// Replaces the base query. It must not carry its own LIMIT.
    pub fn query(mut self, sql: &str, params: Vec<Value>) -> Self {
        self.query = sql.to_string();
        self.params = params;
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn session(&self) -> Result<Session<'p>> {
        self.handle.persistor().provision(self.handle.entity())?;
        Ok(self.handle.session())
    }

    /// Rows the base query yields, counted on first use.
    pub fn total(&mut self) -> Result<usize> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        let session = self.session()?;
        let sql = session.dialect.count_sql(&self.query);
        let counted = session
            .query(&sql, &self.params)?
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize;
        self.total = Some(counted);
        Ok(counted)
    }

    /// Number of windows fetched so far.
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    /// The next window of rows, or `None` once the offset has passed the total.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        if self.done || self.offset >= self.total()? {
            self.done = true;
            return Ok(None);
        }
        let session = self.session()?;
        let sql = format!("{} {}", self.query, session.dialect.limit_clause(self.limit, self.offset));
        let rows = session.query(&sql, &self.params)?;
        self.fetches += 1;
        self.offset += self.limit;
        debug!(entity = %self.handle.entity().name(), rows = rows.len(), offset = self.offset, "stream window");
        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Applies `visit` to the first column of every row.
    pub fn each<T, F>(self, mut visit: F) -> Result<Vec<T>>
    where
        F: FnMut(&Value) -> Flow<T>,
    {
        self.each_tuple(|row| match row.first() {
            Some(value) => visit(value),
            None => Flow::Skip,
        })
    }

    /// Applies `visit` to every row.
    pub fn each_tuple<T, F>(mut self, mut visit: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row) -> Flow<T>,
    {
        let mut collected = Vec::new();
        while let Some(rows) = self.next_batch()? {
            for row in &rows {
                match visit(row) {
                    Flow::Continue(values) => collected.extend(values),
                    Flow::Skip => {}
                    Flow::Stop(values) => {
                        collected.extend(values);
                        return Ok(collected);
                    }
                }
            }
        }
        Ok(collected)
    }
}

impl Iterator for Stream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            match self.next_batch() {
                Ok(Some(rows)) => self.buffer.extend(rows),
                Ok(None) => return None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
