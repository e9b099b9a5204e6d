use crate::backend::{BackendExt, Direction, Filter};
use crate::common::query::{contains_pattern, normalize};
use crate::common::sync::lock;
use crate::coordinator::{Activity, FetchCoordinator};
use crate::error::Result;
use crate::model::{PostRow, PostView, Profile};
use crate::state::StoreContext;
use crate::telemetry::Event;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const DOMAIN: &str = "search";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SearchSnapshot {
    posts: Vec<PostView>,
    users: Vec<Profile>,
}

pub struct SearchStore {
    ctx: StoreContext,
    state: Arc<Mutex<SearchSnapshot>>,
    post_searches: FetchCoordinator<String, Arc<Vec<PostView>>>,
    activity: Activity,
}

impl SearchStore {
    pub fn new(ctx: StoreContext) -> Self {
        let snapshot: SearchSnapshot = ctx.cache.load(DOMAIN);
        SearchStore {
            post_searches: FetchCoordinator::new(DOMAIN, ctx.telemetry.clone()),
            activity: Activity::new(),
            state: Arc::new(Mutex::new(snapshot)),
            ctx,
        }
    }

    pub fn posts(&self) -> Vec<PostView> {
        lock(&self.state).posts.clone()
    }

    pub fn users(&self) -> Vec<Profile> {
        lock(&self.state).users.clone()
    }

    pub fn loading(&self) -> bool {
        self.post_searches.is_loading() || self.activity.is_active()
    }

    /// Posts whose content contains `query`, newest first. A blank query
    /// clears the results without a request.
    pub async fn search_posts(&self, query: &str) -> Result<Arc<Vec<PostView>>> {
        let Some(query) = normalize(query) else {
            self.update(|state| state.posts.clear());
            return Ok(Arc::new(Vec::new()));
        };

        let ctx = self.ctx.clone();
        let state = self.state.clone();
        self.post_searches
            .fetch(query.clone(), move || async move {
                let result = find_posts(&ctx, &query).await;
                let posts = result.as_ref().cloned().unwrap_or_default();
                save(&ctx, &state, |state| state.posts = posts);

                match result {
                    Ok(posts) => Ok(Arc::new(posts)),
                    Err(err) => {
                        ctx.telemetry.record(
                            Event::error(DOMAIN, "search.posts_failed")
                                .field("query", &query)
                                .field("error", &err),
                        );
                        Err(err)
                    }
                }
            })
            .await
    }

    /// Profiles whose username or full name contains `query`, by username.
    pub async fn search_users(&self, query: &str) -> Result<Vec<Profile>> {
        let Some(query) = normalize(query) else {
            self.update(|state| state.users.clear());
            return Ok(Vec::new());
        };

        let _active = self.activity.start();
        let pattern = contains_pattern(&query);
        let result: Result<Vec<Profile>> = self
            .ctx
            .backend
            .from("profiles")
            .any(vec![
                Filter::ILike("username".to_string(), pattern.clone()),
                Filter::ILike("full_name".to_string(), pattern),
            ])
            .order("username", Direction::Ascending)
            .fetch()
            .await;

        let users = result.as_ref().cloned().unwrap_or_default();
        self.update(|state| state.users = users);
        if let Err(err) = &result {
            self.ctx.telemetry.record(
                Event::error(DOMAIN, "search.users_failed")
                    .field("query", &query)
                    .field("error", err),
            );
        }
        result
    }

    pub fn clear_results(&self) {
        self.update(|state| {
            state.posts.clear();
            state.users.clear();
        });
    }

    fn update(&self, f: impl FnOnce(&mut SearchSnapshot)) {
        save(&self.ctx, &self.state, f);
    }
}

async fn find_posts(ctx: &StoreContext, query: &str) -> Result<Vec<PostView>> {
    let rows: Vec<PostRow> = ctx
        .backend
        .from("posts")
        .ilike("content", contains_pattern(query))
        .order("created_at", Direction::Descending)
        .fetch()
        .await?;

    let viewer_id = ctx.viewer.id();
    ctx.aggregator().posts(rows, viewer_id.as_deref()).await
}

fn save(ctx: &StoreContext, state: &Mutex<SearchSnapshot>, f: impl FnOnce(&mut SearchSnapshot)) {
    let snapshot = {
        let mut state = lock(state);
        f(&mut state);
        state.clone()
    };
    ctx.cache.save(DOMAIN, &snapshot);
}
