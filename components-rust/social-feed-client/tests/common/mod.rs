#![allow(dead_code)]

use serde_json::{json, Value};
use social_feed_client::backend::{Backend, MemoryBackend};
use social_feed_client::cache::{KeyValueStore, MemoryStore};
use social_feed_client::telemetry::RecordingTelemetry;
use social_feed_client::{AppState, ClientConfig};
use std::sync::Arc;

pub const PASSWORD: &str = "correct horse";

pub struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub storage: Arc<MemoryStore>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub app: AppState,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture::with(config(), Arc::new(MemoryBackend::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Fixture::with(config, Arc::new(MemoryBackend::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with(config: ClientConfig, backend: Arc<MemoryBackend>, storage: Arc<MemoryStore>) -> Self {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let app = AppState::new(
            config,
            backend.clone() as Arc<dyn Backend>,
            storage.clone() as Arc<dyn KeyValueStore>,
            telemetry.clone(),
        );
        Fixture {
            backend,
            storage,
            telemetry,
            app,
        }
    }

    /// A second application instance over the same backend and local storage.
    pub fn restart(&self) -> Fixture {
        Fixture::with(config(), self.backend.clone(), self.storage.clone())
    }

    /// Profiles `u1` (ann), `u2` (bob) and `u3` (cyd).
    pub fn seed_users(&self) {
        self.backend.seed(
            "profiles",
            vec![
                profile("u1", "ann", Some("Ann Archer")),
                profile("u2", "bob", Some("Bob Baker")),
                profile("u3", "cyd", None),
            ],
        );
    }

    /// Posts `p1` (u1, oldest), `p2` (u2) and `p3` (u1, newest).
    pub fn seed_posts(&self) {
        self.backend.seed(
            "posts",
            vec![
                post("p1", "u1", "Learning Rust", 1),
                post("p2", "u2", "Hello world", 2),
                post("p3", "u1", "Rust async is fun", 3),
            ],
        );
    }

    pub async fn sign_in(&self, user_id: &str) {
        let email = format!("{user_id}@example.com");
        self.backend.add_account(&email, PASSWORD, user_id);
        self.app
            .session
            .login(&email, PASSWORD)
            .await
            .expect("login succeeds");
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new("http://localhost:54321/", "anon-key")
}

pub fn at(day: u32) -> String {
    format!("2024-01-{day:02}T00:00:00Z")
}

pub fn profile(id: &str, username: &str, full_name: Option<&str>) -> Value {
    json!({
        "id": id,
        "username": username,
        "full_name": full_name,
        "bio": null,
        "avatar_url": null,
    })
}

pub fn post(id: &str, user_id: &str, content: &str, day: u32) -> Value {
    json!({
        "id": id,
        "user_id": user_id,
        "content": content,
        "image_url": null,
        "created_at": at(day),
    })
}

pub fn comment(id: &str, post_id: &str, parent_id: Option<&str>, user_id: &str, day: u32) -> Value {
    json!({
        "id": id,
        "post_id": post_id,
        "parent_id": parent_id,
        "user_id": user_id,
        "content": format!("comment {id}"),
        "created_at": at(day),
    })
}

/// `count` likes on `post_id` from distinct users.
pub fn likes(post_id: &str, count: usize) -> Vec<Value> {
    (0..count)
        .map(|n| {
            json!({
                "id": format!("{post_id}-like-{n}"),
                "post_id": post_id,
                "user_id": format!("fan-{n}"),
            })
        })
        .collect()
}

pub fn ids(posts: &[social_feed_client::model::PostView]) -> Vec<&str> {
    posts.iter().map(|p| p.id()).collect()
}
