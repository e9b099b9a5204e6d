use super::{Backend, BackendResult, Direction, Filter, Query};
use crate::common::sync::lock;
use crate::config::ClientConfig;
use crate::error::BackendError;
use crate::model::{AuthChange, AuthUser, Blob, Session, SignUp};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;

/// Gateway to a hosted Postgres REST / storage / auth service over HTTP.
pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    session: Mutex<Option<Session>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AuthChange>>>,
}

impl RestBackend {
    pub fn new(config: &ClientConfig) -> Self {
        RestBackend {
            http: reqwest::Client::new(),
            base_url: config.backend_url.clone(),
            api_key: config.api_key.clone(),
            session: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn headers(&self) -> HeaderMap {
        let token = lock(&self.session)
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.api_key.clone());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert("apikey", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .headers(self.headers())
    }

    fn rest(&self, method: Method, table: &str, filters: &[Filter]) -> RequestBuilder {
        self.request(method, &format!("/rest/v1/{table}"))
            .query(&filter_params(filters))
    }

    fn set_session(&self, session: Option<Session>) {
        *lock(&self.session) = session.clone();
        let change = match session {
            Some(session) => AuthChange::SignedIn(session),
            None => AuthChange::SignedOut,
        };
        lock(&self.listeners).retain(|tx| tx.unbounded_send(change.clone()).is_ok());
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Turns a non-success response into a [`BackendError`] carrying the service's code.
async fn check(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let error = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => {
            let message = body
                .message
                .or(body.msg)
                .or(body.error_description)
                .or(body.error)
                .unwrap_or_else(|| status.to_string());
            let code = body.error_code.or_else(|| {
                body.code.map(|c| match c {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
            });
            let mut error = BackendError::new(message);
            error.code = code;
            error
        }
        Err(_) if !text.is_empty() => BackendError::new(text),
        Err(_) => BackendError::new(status.to_string()),
    };
    Err(error.with_status(status.as_u16()))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: AuthUser,
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user: token.user,
        }
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: Query) -> BackendResult<Vec<Value>> {
        let mut params = vec![("select".to_string(), query.columns.replace(' ', ""))];
        if let Some(order) = &query.order {
            params.push(("order".to_string(), order_param(&order.column, order.direction)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .rest(Method::GET, &query.table, &query.filters)
            .query(&params)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn count(&self, table: &str, filters: Vec<Filter>) -> BackendResult<Option<u64>> {
        let response = self
            .rest(Method::HEAD, table, &filters)
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range))
    }

    async fn insert(&self, table: &str, row: Value) -> BackendResult<Value> {
        let response = self
            .rest(Method::POST, table, &[])
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        let mut rows: Vec<Value> = check(response).await?.json().await?;
        if rows.is_empty() {
            Err(BackendError::new(format!("insert into {table} returned no row")))
        } else {
            Ok(rows.remove(0))
        }
    }

    async fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Value,
    ) -> BackendResult<Vec<Value>> {
        let response = self
            .rest(Method::PATCH, table, &filters)
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete(&self, table: &str, filters: Vec<Filter>) -> BackendResult<()> {
        let response = self.rest(Method::DELETE, table, &filters).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, path: &str, blob: &Blob) -> BackendResult<()> {
        let mut headers = self.headers();
        if let Ok(content_type) = HeaderValue::from_str(&blob.content_type) {
            headers.insert(CONTENT_TYPE, content_type);
        }
        let response = self
            .http
            .post(format!("{}/storage/v1/object/{bucket}/{path}", self.base_url))
            .headers(headers)
            .body(blob.bytes.clone())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }

    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String> {
        let prefix = format!("{}/storage/v1/object/public/{bucket}/", self.base_url);
        url.strip_prefix(&prefix)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }

    async fn remove(&self, bucket: &str, paths: Vec<String>) -> BackendResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/storage/v1/object/{bucket}"))
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> BackendResult<SignUp> {
        let response = self
            .request(Method::POST, "/auth/v1/signup")
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "username": username },
            }))
            .send()
            .await?;
        let body: Value = check(response).await?.json().await?;

        // With email confirmation disabled the service answers with a full session.
        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value::<TokenResponse>(body)
                .map_err(|e| BackendError::new(e.to_string()))?
                .into();
            self.set_session(Some(session.clone()));
            Ok(SignUp {
                user: Some(session.user.clone()),
                session: Some(session),
            })
        } else {
            let user = serde_json::from_value::<AuthUser>(body).ok();
            Ok(SignUp {
                user,
                session: None,
            })
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<Session> {
        let response = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let token: TokenResponse = check(response).await?.json().await?;
        let session = Session::from(token);
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        let response = self.request(Method::POST, "/auth/v1/logout").send().await?;
        check(response).await?;
        self.set_session(None);
        Ok(())
    }

    async fn get_session(&self) -> BackendResult<Option<Session>> {
        Ok(lock(&self.session).clone())
    }

    fn auth_changes(&self) -> BoxStream<'static, AuthChange> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.listeners).push(tx);
        rx.boxed()
    }
}

fn order_param(column: &str, direction: Direction) -> String {
    match direction {
        Direction::Ascending => format!("{column}.asc"),
        Direction::Descending => format!("{column}.desc"),
    }
}

fn value_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inside `or=(..)` values are double quoted so `,`, `.`, `:` and parentheses
/// in user text stay part of the value.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn filter_expr(filter: &Filter) -> String {
    match filter {
        Filter::Eq(column, value) => format!("{column}.eq.{}", quoted(&value_param(value))),
        Filter::ILike(column, pattern) => format!("{column}.ilike.{}", quoted(pattern)),
        Filter::IsNull(column) => format!("{column}.is.null"),
        Filter::Any(filters) => {
            let inner: Vec<String> = filters.iter().map(filter_expr).collect();
            format!("or({})", inner.join(","))
        }
    }
}

/// Query-string encoding of filters: `column=op.value`, or-groups as `or=(..)`.
fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", value_param(value))),
            Filter::ILike(column, pattern) => (column.clone(), format!("ilike.{pattern}")),
            Filter::IsNull(column) => (column.clone(), "is.null".to_string()),
            Filter::Any(filters) => {
                let inner: Vec<String> = filters.iter().map(filter_expr).collect();
                ("or".to_string(), format!("({})", inner.join(",")))
            }
        })
        .collect()
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(value: &str) -> Option<u64> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_filters_as_query_params() {
        let params = filter_params(&[
            Filter::Eq("post_id".to_string(), json!("p1")),
            Filter::Eq("version".to_string(), json!(3)),
            Filter::IsNull("parent_id".to_string()),
            Filter::Any(vec![
                Filter::ILike("username".to_string(), "%kim%".to_string()),
                Filter::ILike("full_name".to_string(), "%kim%".to_string()),
            ]),
        ]);

        assert_eq!(
            params,
            vec![
                ("post_id".to_string(), "eq.p1".to_string()),
                ("version".to_string(), "eq.3".to_string()),
                ("parent_id".to_string(), "is.null".to_string()),
                (
                    "or".to_string(),
                    r#"(username.ilike."%kim%",full_name.ilike."%kim%")"#.to_string()
                ),
            ]
        );
        assert_eq!(order_param("created_at", Direction::Descending), "created_at.desc");
    }

    #[test]
    fn quotes_reserved_characters_inside_or_groups() {
        let pattern = "%Kim, Lee (dev) \"KL\" a\\b%".to_string();
        let params = filter_params(&[Filter::Any(vec![
            Filter::ILike("username".to_string(), pattern.clone()),
            Filter::Eq("id".to_string(), json!("u1,u2")),
        ])]);

        assert_eq!(
            params,
            vec![(
                "or".to_string(),
                r#"(username.ilike."%Kim, Lee (dev) \"KL\" a\\b%",id.eq."u1,u2")"#.to_string()
            )]
        );
        assert_eq!(
            filter_params(&[Filter::ILike("content".to_string(), pattern.clone())]),
            vec![("content".to_string(), format!("ilike.{pattern}"))]
        );
    }

    #[test]
    fn parses_content_range_totals() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
    }

    #[test]
    fn public_url_roundtrip() {
        let backend = RestBackend::new(&ClientConfig::new("https://demo.supabase.co", "anon"));
        let url = backend.public_url("post-images", "1700000000_a.png");
        assert_eq!(
            url,
            "https://demo.supabase.co/storage/v1/object/public/post-images/1700000000_a.png"
        );
        assert_eq!(
            backend.path_from_public_url("post-images", &url),
            Some("1700000000_a.png".to_string())
        );
        assert_eq!(backend.path_from_public_url("avatars", &url), None);
    }
}
