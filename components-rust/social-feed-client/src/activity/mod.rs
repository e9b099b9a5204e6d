use crate::aggregate::sort_trending;
use crate::backend::{BackendExt, Direction};
use crate::common::sync::lock;
use crate::coordinator::FetchCoordinator;
use crate::error::Result;
use crate::model::{PostRow, PostView};
use crate::state::StoreContext;
use crate::telemetry::Event;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const DOMAIN: &str = "activity";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ActivitySnapshot {
    trending_posts: Vec<PostView>,
}

pub struct ActivityStore {
    ctx: StoreContext,
    state: Arc<Mutex<ActivitySnapshot>>,
    trending: FetchCoordinator<(), Arc<Vec<PostView>>>,
}

impl ActivityStore {
    pub fn new(ctx: StoreContext) -> Self {
        let snapshot: ActivitySnapshot = ctx.cache.load(DOMAIN);
        ActivityStore {
            trending: FetchCoordinator::new(DOMAIN, ctx.telemetry.clone()),
            state: Arc::new(Mutex::new(snapshot)),
            ctx,
        }
    }

    pub fn trending_posts(&self) -> Vec<PostView> {
        lock(&self.state).trending_posts.clone()
    }

    pub fn loading(&self) -> bool {
        self.trending.is_loading()
    }

    /// Most liked of the latest posts. Concurrent callers share one request;
    /// a failure empties the list.
    pub async fn fetch_trending_posts(&self) -> Result<Arc<Vec<PostView>>> {
        let ctx = self.ctx.clone();
        let state = self.state.clone();

        self.trending
            .fetch((), move || async move {
                let result = load_trending(&ctx).await;
                let posts = result.as_ref().cloned().unwrap_or_default();
                let snapshot = {
                    let mut state = lock(&state);
                    state.trending_posts = posts;
                    state.clone()
                };
                ctx.cache.save(DOMAIN, &snapshot);

                match result {
                    Ok(posts) => {
                        ctx.telemetry
                            .record(Event::new(DOMAIN, "trending.loaded").field("posts", posts.len()));
                        Ok(Arc::new(posts))
                    }
                    Err(err) => {
                        ctx.telemetry
                            .record(Event::error(DOMAIN, "trending.failed").field("error", &err));
                        Err(err)
                    }
                }
            })
            .await
    }
}

async fn load_trending(ctx: &StoreContext) -> Result<Vec<PostView>> {
    let rows: Vec<PostRow> = ctx
        .backend
        .from("posts")
        .order("created_at", Direction::Descending)
        .limit(ctx.config.trending_window)
        .fetch()
        .await?;

    let viewer_id = ctx.viewer.id();
    let posts = ctx.aggregator().posts(rows, viewer_id.as_deref()).await?;
    Ok(sort_trending(posts, ctx.config.trending_limit))
}
