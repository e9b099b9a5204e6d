//! Gateway to the hosted database, blob storage and auth service.
//!
//! [`Backend`] is the raw, object-safe contract: rows travel as JSON values and
//! every call answers with data or a [`BackendError`]. Stores go through the
//! typed [`Table`] builder returned by [`BackendExt::from`].

mod memory;
mod rest;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

use crate::error::{BackendError, Error, Result};
use crate::model::{AuthChange, Blob, Session, SignUp};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Code reported when a single-row fetch finds zero or several rows.
pub const SINGLE_ROW_CODE: &str = "PGRST116";

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Case-insensitive LIKE pattern.
    ILike(String, String),
    IsNull(String),
    /// Matches when any of the inner filters matches.
    Any(Vec<Filter>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Query {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: Query) -> BackendResult<Vec<Value>>;

    /// Count-only query; `None` when the service reports no count.
    async fn count(&self, table: &str, filters: Vec<Filter>) -> BackendResult<Option<u64>>;

    /// Inserts one row and returns it as stored.
    async fn insert(&self, table: &str, row: Value) -> BackendResult<Value>;

    async fn update(&self, table: &str, filters: Vec<Filter>, patch: Value)
        -> BackendResult<Vec<Value>>;

    async fn delete(&self, table: &str, filters: Vec<Filter>) -> BackendResult<()>;

    async fn upload(&self, bucket: &str, path: &str, blob: &Blob) -> BackendResult<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Inverse of [`Backend::public_url`]; `None` for URLs outside the bucket.
    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String>;

    async fn remove(&self, bucket: &str, paths: Vec<String>) -> BackendResult<()>;

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> BackendResult<SignUp>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<Session>;

    async fn sign_out(&self) -> BackendResult<()>;

    async fn get_session(&self) -> BackendResult<Option<Session>>;

    fn auth_changes(&self) -> BoxStream<'static, AuthChange>;
}

pub trait BackendExt {
    fn from(&self, table: &str) -> Table<'_>;
}

impl BackendExt for dyn Backend {
    fn from(&self, table: &str) -> Table<'_> {
        Table {
            backend: self,
            query: Query::new(table),
        }
    }
}

pub struct Table<'a> {
    backend: &'a dyn Backend,
    query: Query,
}

impl<'a> Table<'a> {
    pub fn columns(mut self, columns: &str) -> Self {
        self.query.columns = columns.to_string();
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query
            .filters
            .push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.query
            .filters
            .push(Filter::ILike(column.to_string(), pattern.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.query.filters.push(Filter::IsNull(column.to_string()));
        self
    }

    pub fn any(mut self, filters: Vec<Filter>) -> Self {
        self.query.filters.push(Filter::Any(filters));
        self
    }

    pub fn order(mut self, column: &str, direction: Direction) -> Self {
        self.query.order = Some(Order {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    fn at_most_two(self) -> Self {
        let limit = self.query.limit.map_or(2, |limit| limit.min(2));
        self.limit(limit)
    }

    pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        let rows = self.backend.select(self.query).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(Error::from))
            .collect()
    }

    /// Exactly one row, otherwise a backend error with [`SINGLE_ROW_CODE`].
    pub async fn single<T: DeserializeOwned>(self) -> Result<T> {
        let table = self.query.table.clone();
        let mut rows: Vec<T> = self.at_most_two().fetch().await?;
        if rows.len() == 1 {
            Ok(rows.remove(0))
        } else {
            Err(single_row_error(&table, rows.len()).into())
        }
    }

    /// Zero or one row; several rows is a backend error with [`SINGLE_ROW_CODE`].
    pub async fn maybe_single<T: DeserializeOwned>(self) -> Result<Option<T>> {
        let table = self.query.table.clone();
        let mut rows: Vec<T> = self.at_most_two().fetch().await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.remove(0))),
            n => Err(single_row_error(&table, n).into()),
        }
    }

    pub async fn count(self) -> Result<u64> {
        let count = self
            .backend
            .count(&self.query.table, self.query.filters)
            .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn insert<T: Serialize, R: DeserializeOwned>(self, row: &T) -> Result<R> {
        let row = serde_json::to_value(row)?;
        let stored = self.backend.insert(&self.query.table, row).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn update_single<T: Serialize, R: DeserializeOwned>(self, patch: &T) -> Result<R> {
        let patch = serde_json::to_value(patch)?;
        let mut rows = self
            .backend
            .update(&self.query.table, self.query.filters, patch)
            .await?;
        if rows.len() == 1 {
            Ok(serde_json::from_value(rows.remove(0))?)
        } else {
            Err(single_row_error(&self.query.table, rows.len()).into())
        }
    }

    pub async fn delete(self) -> Result<()> {
        self.backend
            .delete(&self.query.table, self.query.filters)
            .await?;
        Ok(())
    }
}

fn single_row_error(table: &str, rows: usize) -> BackendError {
    BackendError::new(format!(
        "expected a single row from {table}, the result contains {rows} rows"
    ))
    .with_code(SINGLE_ROW_CODE)
    .with_status(406)
}
