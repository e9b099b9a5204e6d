use super::{Backend, BackendResult, Direction, Filter, Query};
use crate::common::query::like_to_regex;
use crate::common::sync::lock;
use crate::error::BackendError;
use crate::model::{AuthChange, AuthUser, Blob, Session, SignUp};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

const PUBLIC_URL_BASE: &str = "memory://storage";

#[derive(Clone)]
struct Account {
    password: String,
    user: AuthUser,
    confirmed: bool,
}

/// In-process backend with the same request/response semantics as the hosted
/// service. Every call is appended to a call log (`"<op>:<table or bucket>"`).
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    blobs: Mutex<BTreeMap<(String, String), Blob>>,
    accounts: Mutex<HashMap<String, Account>>,
    session: Mutex<Option<Session>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AuthChange>>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, BackendError>>,
    latencies: Mutex<HashMap<String, Duration>>,
    latency: Mutex<Option<Duration>>,
    require_confirmation: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Blob> {
        lock(&self.blobs)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub fn blob_paths(&self, bucket: &str) -> Vec<String> {
        lock(&self.blobs)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn add_account(&self, email: &str, password: &str, user_id: &str) {
        lock(&self.accounts).insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                user: AuthUser::new(user_id, Some(email.to_string())),
                confirmed: true,
            },
        );
    }

    /// New sign-ups cannot sign in until confirmed.
    pub fn require_email_confirmation(&self, required: bool) {
        *lock(&self.require_confirmation) = required;
    }

    /// Makes every call on `target` (a table, a bucket, or `"auth"`) fail.
    pub fn fail_on(&self, target: &str, message: &str) {
        lock(&self.failures).insert(target.to_string(), BackendError::new(message));
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Delay applied to calls on one table or bucket, overriding the global one.
    pub fn set_latency_for(&self, target: &str, latency: Duration) {
        lock(&self.latencies).insert(target.to_string(), latency);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Emits an auth change as if the service had pushed it.
    pub fn emit(&self, change: AuthChange) {
        lock(&self.listeners).retain(|tx| tx.unbounded_send(change.clone()).is_ok());
    }

    async fn enter(&self, op: &str, target: &str) -> BackendResult<()> {
        lock(&self.calls).push(format!("{op}:{target}"));

        let latency = lock(&self.latencies)
            .get(target)
            .copied()
            .or(*lock(&self.latency));
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        match lock(&self.failures).get(target) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn set_session(&self, session: Option<Session>) {
        *lock(&self.session) = session.clone();
        let change = match session {
            Some(session) => AuthChange::SignedIn(session),
            None => AuthChange::SignedOut,
        };
        self.emit(change);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: Query) -> BackendResult<Vec<Value>> {
        self.enter("select", &query.table).await?;

        let matcher = Matcher::new(&query.filters)?;
        let mut rows: Vec<Value> = lock(&self.tables)
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| matcher.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(&a[&order.column], &b[&order.column]);
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows
            .into_iter()
            .map(|row| project(row, &query.columns))
            .collect())
    }

    async fn count(&self, table: &str, filters: Vec<Filter>) -> BackendResult<Option<u64>> {
        self.enter("count", table).await?;

        let matcher = Matcher::new(&filters)?;
        let count = lock(&self.tables)
            .get(table)
            .map(|rows| rows.iter().filter(|r| matcher.matches(r)).count() as u64);
        Ok(count)
    }

    async fn insert(&self, table: &str, row: Value) -> BackendResult<Value> {
        self.enter("insert", table).await?;

        let Value::Object(mut row) = row else {
            return Err(BackendError::new("row must be a JSON object").with_status(400));
        };
        if row.get("id").map_or(true, Value::is_null) {
            row.insert("id".to_string(), uuid::Uuid::new_v4().to_string().into());
        }
        if row.get("created_at").map_or(true, Value::is_null) {
            row.insert(
                "created_at".to_string(),
                chrono::Utc::now().to_rfc3339().into(),
            );
        }

        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| r["id"] == row["id"]) {
            return Err(BackendError::new(format!(
                "duplicate key value violates unique constraint \"{table}_pkey\""
            ))
            .with_code("23505")
            .with_status(409));
        }
        let row = Value::Object(row);
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Value,
    ) -> BackendResult<Vec<Value>> {
        self.enter("update", table).await?;

        let Value::Object(patch) = patch else {
            return Err(BackendError::new("patch must be a JSON object").with_status(400));
        };
        let matcher = Matcher::new(&filters)?;
        let mut tables = lock(&self.tables);
        let mut updated = Vec::new();
        for row in tables.entry(table.to_string()).or_default().iter_mut() {
            if matcher.matches(row) {
                if let Value::Object(fields) = row {
                    for (key, value) in patch.iter() {
                        fields.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: Vec<Filter>) -> BackendResult<()> {
        self.enter("delete", table).await?;

        let matcher = Matcher::new(&filters)?;
        if let Some(rows) = lock(&self.tables).get_mut(table) {
            rows.retain(|r| !matcher.matches(r));
        }
        Ok(())
    }

    async fn upload(&self, bucket: &str, path: &str, blob: &Blob) -> BackendResult<()> {
        self.enter("upload", bucket).await?;

        let key = (bucket.to_string(), path.to_string());
        let mut blobs = lock(&self.blobs);
        if blobs.contains_key(&key) {
            return Err(BackendError::new("The resource already exists").with_status(409));
        }
        blobs.insert(key, blob.clone());
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{PUBLIC_URL_BASE}/{bucket}/{path}")
    }

    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String> {
        url.strip_prefix(&format!("{PUBLIC_URL_BASE}/{bucket}/"))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }

    async fn remove(&self, bucket: &str, paths: Vec<String>) -> BackendResult<()> {
        self.enter("remove", bucket).await?;

        let mut blobs = lock(&self.blobs);
        for path in paths {
            blobs.remove(&(bucket.to_string(), path));
        }
        Ok(())
    }

    /// Also creates the account's profile row, as the hosted service does on sign-up.
    async fn sign_up(&self, email: &str, password: &str, username: &str) -> BackendResult<SignUp> {
        self.enter("sign_up", "auth").await?;

        let confirmed = !*lock(&self.require_confirmation);
        let user = {
            let mut accounts = lock(&self.accounts);
            let key = email.to_lowercase();
            if accounts.contains_key(&key) {
                return Err(BackendError::new("User already registered")
                    .with_code("user_already_exists")
                    .with_status(422));
            }
            let user = AuthUser::new(uuid::Uuid::new_v4().to_string(), Some(email.to_string()));
            accounts.insert(
                key,
                Account {
                    password: password.to_string(),
                    user: user.clone(),
                    confirmed,
                },
            );
            user
        };
        self.seed(
            "profiles",
            vec![json!({
                "id": user.id,
                "username": username,
                "full_name": null,
                "bio": null,
                "avatar_url": null,
            })],
        );

        let session = if confirmed {
            let session = new_session(user.clone());
            self.set_session(Some(session.clone()));
            Some(session)
        } else {
            None
        };
        Ok(SignUp {
            user: Some(user),
            session,
        })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<Session> {
        self.enter("sign_in", "auth").await?;

        let account = lock(&self.accounts)
            .get(&email.to_lowercase())
            .filter(|a| a.password == password)
            .cloned()
            .ok_or_else(|| {
                BackendError::new("Invalid login credentials")
                    .with_code("invalid_credentials")
                    .with_status(400)
            })?;
        if !account.confirmed {
            return Err(BackendError::new("Email not confirmed")
                .with_code("email_not_confirmed")
                .with_status(400));
        }

        let session = new_session(account.user);
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        self.enter("sign_out", "auth").await?;
        self.set_session(None);
        Ok(())
    }

    async fn get_session(&self) -> BackendResult<Option<Session>> {
        self.enter("get_session", "auth").await?;
        Ok(lock(&self.session).clone())
    }

    fn auth_changes(&self) -> BoxStream<'static, AuthChange> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.listeners).push(tx);
        rx.boxed()
    }
}

fn new_session(user: AuthUser) -> Session {
    Session {
        access_token: uuid::Uuid::new_v4().to_string(),
        refresh_token: Some(uuid::Uuid::new_v4().to_string()),
        user,
    }
}

fn project(row: Value, columns: &str) -> Value {
    if columns.trim() == "*" {
        return row;
    }
    let wanted: HashSet<&str> = columns.split(',').map(str::trim).collect();
    match row {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(k, _)| wanted.contains(k.as_str()))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Filters compiled once per call.
struct Matcher<'a> {
    filters: &'a [Filter],
    patterns: HashMap<String, Regex>,
}

impl<'a> Matcher<'a> {
    fn new(filters: &'a [Filter]) -> BackendResult<Self> {
        let mut patterns = HashMap::new();
        compile_patterns(filters, &mut patterns)?;
        Ok(Matcher { filters, patterns })
    }

    fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| self.matches_filter(f, row))
    }

    fn matches_filter(&self, filter: &Filter, row: &Value) -> bool {
        match filter {
            Filter::Eq(column, expected) => values_equal(&row[column.as_str()], expected),
            Filter::ILike(column, pattern) => match (&row[column.as_str()], self.patterns.get(pattern)) {
                (Value::String(text), Some(re)) => re.is_match(text),
                _ => false,
            },
            Filter::IsNull(column) => row[column.as_str()].is_null(),
            Filter::Any(filters) => filters.iter().any(|f| self.matches_filter(f, row)),
        }
    }
}

fn compile_patterns(filters: &[Filter], patterns: &mut HashMap<String, Regex>) -> BackendResult<()> {
    for filter in filters {
        match filter {
            Filter::ILike(_, pattern) if !patterns.contains_key(pattern) => {
                let re = Regex::new(&like_to_regex(pattern)).map_err(|e| {
                    BackendError::new(format!("invalid pattern {pattern}: {e}")).with_status(400)
                })?;
                patterns.insert(pattern.clone(), re);
            }
            Filter::Any(inner) => compile_patterns(inner, patterns)?,
            _ => {}
        }
    }
    Ok(())
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            *a == b.to_string()
        }
        _ => actual == expected,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(a), Value::String(b)) => {
            match (
                chrono::DateTime::parse_from_rfc3339(a),
                chrono::DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExt;
    use serde_json::json;
    use std::sync::Arc;

    fn backend() -> Arc<dyn Backend> {
        let backend = MemoryBackend::new();
        backend.seed(
            "posts",
            vec![
                json!({"id": "p1", "user_id": "u1", "content": "Hello Rust", "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": "p2", "user_id": "u2", "content": "hello world", "created_at": "2024-01-02T00:00:00.5Z"}),
                json!({"id": "p3", "user_id": "u1", "content": "bye", "created_at": "2024-01-02T00:00:00Z", "parent_id": null}),
            ],
        );
        Arc::new(backend)
    }

    #[tokio::test]
    async fn filters_order_and_limit() {
        let backend = backend();

        let ids: Vec<String> = backend
            .from("posts")
            .columns("id")
            .ilike("content", "%hello%")
            .order("created_at", Direction::Descending)
            .fetch::<Value>()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["p2", "p1"]);

        let newest: Value = backend
            .from("posts")
            .order("created_at", Direction::Descending)
            .limit(1)
            .single()
            .await
            .unwrap();
        assert_eq!(newest["id"], "p2");

        let count = backend.from("posts").eq("user_id", "u1").count().await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn single_row_errors() {
        let backend = backend();

        let err = backend
            .from("posts")
            .eq("user_id", "u1")
            .single::<Value>()
            .await
            .unwrap_err();
        assert_eq!(err.backend_code(), Some(crate::backend::SINGLE_ROW_CODE));

        let missing = backend
            .from("posts")
            .eq("id", "nope")
            .maybe_single::<Value>()
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn any_and_is_null_filters() {
        let backend = backend();
        let rows = backend
            .from("posts")
            .any(vec![
                Filter::ILike("content".to_string(), "bye".to_string()),
                Filter::Eq("id".to_string(), json!("p2")),
            ])
            .fetch::<Value>()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let null_parent = backend.from("posts").is_null("parent_id").count().await.unwrap();
        assert_eq!(null_parent, 3);
    }

    #[tokio::test]
    async fn failure_injection_and_call_log() {
        let memory = Arc::new(MemoryBackend::new());
        memory.fail_on("likes", "permission denied");
        let backend: Arc<dyn Backend> = memory.clone();

        assert!(backend.from("likes").count().await.is_err());
        assert_eq!(backend.from("comments").count().await.unwrap(), 0);
        assert_eq!(memory.calls(), vec!["count:likes", "count:comments"]);
    }
}
