use crate::aggregate::sort_recent;
use crate::backend::{BackendExt, Direction};
use crate::common::blob::extension;
use crate::common::sync::lock;
use crate::coordinator::{Activity, FetchCoordinator, KeyedSerializer};
use crate::error::{Error, Result};
use crate::model::{
    AuthUser, Blob, CommentRow, CommentView, ImageChange, NewPost, PostCounts, PostRow,
    PostUpdate, PostView, RowId,
};
use crate::state::StoreContext;
use crate::telemetry::Event;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const DOMAIN: &str = "posts";

#[derive(Default)]
struct PostsState {
    posts: Vec<PostView>,
    error: Option<String>,
    /// Like toggles per post that are running or waiting for their turn.
    pending_likes: HashMap<String, usize>,
}

pub struct PostsStore {
    ctx: StoreContext,
    state: Arc<Mutex<PostsState>>,
    feed: FetchCoordinator<(), Arc<Vec<PostView>>>,
    comments: FetchCoordinator<String, Arc<Vec<CommentView>>>,
    activity: Activity,
    likes: KeyedSerializer<(String, String)>,
}

impl PostsStore {
    pub fn new(ctx: StoreContext) -> Self {
        PostsStore {
            feed: FetchCoordinator::new(DOMAIN, ctx.telemetry.clone()),
            comments: FetchCoordinator::new(DOMAIN, ctx.telemetry.clone()),
            activity: Activity::new(),
            likes: KeyedSerializer::new(),
            state: Arc::new(Mutex::new(PostsState::default())),
            ctx,
        }
    }

    pub fn posts(&self) -> Vec<PostView> {
        lock(&self.state).posts.clone()
    }

    pub fn post(&self, post_id: &str) -> Option<PostView> {
        lock(&self.state)
            .posts
            .iter()
            .find(|p| p.id() == post_id)
            .cloned()
    }

    pub fn loading(&self) -> bool {
        self.feed.is_loading() || self.comments.is_loading() || self.activity.is_active()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    /// Newest page of the feed. Concurrent callers share one request.
    pub async fn fetch_posts(&self) -> Result<Arc<Vec<PostView>>> {
        let ctx = self.ctx.clone();
        let state = self.state.clone();

        self.feed
            .fetch((), move || async move {
                let result = load_feed(&ctx).await;
                replace_feed(&ctx, &state, result)
            })
            .await
    }

    pub async fn fetch_post(&self, post_id: &str) -> Result<PostView> {
        let _active = self.activity.start();
        let viewer_id = self.ctx.viewer.id();

        let result = async {
            let row: PostRow = self
                .ctx
                .backend
                .from("posts")
                .eq("id", post_id)
                .single()
                .await?;
            self.ctx.aggregator().post(row, viewer_id.as_deref()).await
        }
        .await;

        self.settle("fetch_post", result)
    }

    /// Comment and like totals; a failed count reads as zero.
    pub async fn fetch_post_counts(&self, post_id: &str) -> PostCounts {
        let aggregator = self.ctx.aggregator();
        let counts = futures::try_join!(
            aggregator.comment_count(post_id),
            aggregator.like_count(post_id)
        );

        match counts {
            Ok((comment_count, like_count)) => PostCounts {
                comment_count,
                like_count,
            },
            Err(err) => {
                self.ctx.telemetry.record(
                    Event::warn(DOMAIN, "counts.failed")
                        .field("post_id", post_id)
                        .field("error", err),
                );
                PostCounts::default()
            }
        }
    }

    /// Top-level comments of a post, oldest first, each with its replies.
    /// Concurrent callers for the same post share one request.
    pub async fn fetch_comments(&self, post_id: &str) -> Result<Arc<Vec<CommentView>>> {
        let ctx = self.ctx.clone();
        let key = post_id.to_string();

        let result = self
            .comments
            .fetch(key.clone(), move || async move {
                let rows: Vec<CommentRow> = ctx
                    .backend
                    .from("comments")
                    .eq("post_id", key.as_str())
                    .is_null("parent_id")
                    .order("created_at", Direction::Ascending)
                    .fetch()
                    .await?;
                Ok(Arc::new(ctx.aggregator().threads(rows).await?))
            })
            .await;

        self.settle("fetch_comments", result)
    }

    pub async fn create_post(&self, new_post: NewPost) -> Result<PostView> {
        let _active = self.activity.start();
        let result = self.create(new_post).await;
        self.settle("create_post", result)
    }

    pub async fn update_post(&self, post_id: &str, update: PostUpdate) -> Result<PostView> {
        let _active = self.activity.start();
        let result = self.update(post_id, update).await;
        self.settle("update_post", result)
    }

    pub async fn delete_post(&self, post_id: &str) -> Result<()> {
        let _active = self.activity.start();
        let result = self.delete(post_id).await;
        self.settle("delete_post", result)
    }

    /// Likes or unlikes a post of the collection for the viewer; returns the new state.
    /// Toggles of the same (viewer, post) run one after another.
    pub async fn toggle_like(&self, post_id: &str) -> Result<bool> {
        let viewer = self.ctx.viewer.require()?;
        self.require_post(post_id)?;

        let _loading = LikeLoading::start(&self.state, post_id);
        let _turn = self
            .likes
            .acquire((viewer.id.clone(), post_id.to_string()))
            .await;

        let result = self.flip_like(&viewer, post_id).await;
        if let Ok(liked) = result {
            if let Some(post) = lock(&self.state).posts.iter_mut().find(|p| p.id() == post_id) {
                post.apply_like(liked);
            }
            self.ctx.telemetry.record(
                Event::info(DOMAIN, "like.toggled")
                    .field("post_id", post_id)
                    .field("liked", liked),
            );
        }
        self.settle("toggle_like", result)
    }

    pub async fn add_comment(&self, post_id: &str, content: &str) -> Result<CommentView> {
        let _active = self.activity.start();
        let result = self.comment(post_id, None, content).await;
        self.settle("add_comment", result)
    }

    /// Replies to a top-level comment of the same post.
    pub async fn add_reply(&self, post_id: &str, parent_id: &str, content: &str) -> Result<CommentView> {
        let _active = self.activity.start();
        let result = self.comment(post_id, Some(parent_id), content).await;
        self.settle("add_reply", result)
    }

    async fn create(&self, new_post: NewPost) -> Result<PostView> {
        let viewer = self.ctx.viewer.require()?;
        if new_post.content.trim().is_empty() && new_post.image.is_none() {
            return Err(Error::EmptyContent);
        }

        let author = self.ctx.aggregator().profile_summary(&viewer.id).await?;
        let image_url = match &new_post.image {
            Some(blob) => Some(self.upload_image(blob).await?),
            None => None,
        };

        let inserted: Result<PostRow> = self
            .ctx
            .backend
            .from("posts")
            .insert(&json!({
                "content": new_post.content,
                "image_url": image_url,
                "user_id": viewer.id,
            }))
            .await;
        let row = match inserted {
            Ok(row) => row,
            Err(err) => {
                if let Some(url) = &image_url {
                    self.remove_image(url).await;
                }
                return Err(err);
            }
        };

        let view = PostView::new(row, author);
        lock(&self.state).posts.insert(0, view.clone());
        self.ctx
            .telemetry
            .record(Event::info(DOMAIN, "post.created").field("post_id", view.id()));
        Ok(view)
    }

    async fn update(&self, post_id: &str, update: PostUpdate) -> Result<PostView> {
        let viewer = self.ctx.viewer.require()?;
        let existing = self.require_owned(post_id, &viewer)?;
        let previous_image = existing.post.image_url.clone();

        let (image_url, uploaded, stale) = match update.image {
            ImageChange::Keep => (previous_image, false, None),
            ImageChange::Replace(blob) => {
                (Some(self.upload_image(&blob).await?), true, previous_image)
            }
            ImageChange::Remove => (None, false, previous_image),
        };
        if update.content.trim().is_empty() && image_url.is_none() {
            return Err(Error::EmptyContent);
        }

        let updated: Result<PostRow> = self
            .ctx
            .backend
            .from("posts")
            .eq("id", post_id)
            .update_single(&json!({
                "content": update.content,
                "image_url": image_url,
                "updated_at": chrono::Utc::now(),
            }))
            .await;
        let row = match updated {
            Ok(row) => row,
            Err(err) => {
                if let (true, Some(url)) = (uploaded, &image_url) {
                    self.remove_image(url).await;
                }
                return Err(err);
            }
        };

        if let Some(stale) = stale {
            self.remove_image(&stale).await;
        }

        let view = {
            let mut state = lock(&self.state);
            match state.posts.iter_mut().find(|p| p.id() == post_id) {
                Some(post) => {
                    post.post = row;
                    post.clone()
                }
                None => PostView { post: row, ..existing },
            }
        };
        self.ctx
            .telemetry
            .record(Event::info(DOMAIN, "post.updated").field("post_id", post_id));
        Ok(view)
    }

    async fn delete(&self, post_id: &str) -> Result<()> {
        let viewer = self.ctx.viewer.require()?;
        let existing = self.require_owned(post_id, &viewer)?;

        self.ctx
            .backend
            .from("posts")
            .eq("id", post_id)
            .delete()
            .await?;

        if let Some(url) = &existing.post.image_url {
            self.remove_image(url).await;
        }

        lock(&self.state).posts.retain(|p| p.id() != post_id);
        self.ctx
            .telemetry
            .record(Event::info(DOMAIN, "post.deleted").field("post_id", post_id));
        Ok(())
    }

    /// Checks the viewer's like row and inserts or deletes it.
    async fn flip_like(&self, viewer: &AuthUser, post_id: &str) -> Result<bool> {
        let existing: Option<RowId> = self
            .ctx
            .backend
            .from("likes")
            .columns("id")
            .eq("post_id", post_id)
            .eq("user_id", viewer.id.as_str())
            .maybe_single()
            .await?;

        match existing {
            Some(like) => {
                self.ctx
                    .backend
                    .from("likes")
                    .eq("id", like.id)
                    .delete()
                    .await?;
                Ok(false)
            }
            None => {
                let _: Value = self
                    .ctx
                    .backend
                    .from("likes")
                    .insert(&json!({ "post_id": post_id, "user_id": viewer.id }))
                    .await?;
                Ok(true)
            }
        }
    }

    async fn comment(
        &self,
        post_id: &str,
        parent_id: Option<&str>,
        content: &str,
    ) -> Result<CommentView> {
        let viewer = self.ctx.viewer.require()?;
        if content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }

        if let Some(parent_id) = parent_id {
            let parent: Option<RowId> = self
                .ctx
                .backend
                .from("comments")
                .columns("id")
                .eq("id", parent_id)
                .eq("post_id", post_id)
                .is_null("parent_id")
                .maybe_single()
                .await?;
            if parent.is_none() {
                return Err(Error::InvalidParent {
                    post_id: post_id.to_string(),
                    parent_id: parent_id.to_string(),
                });
            }
        }

        let aggregator = self.ctx.aggregator();
        let author = aggregator.profile_summary(&viewer.id).await?;
        let row: CommentRow = self
            .ctx
            .backend
            .from("comments")
            .insert(&json!({
                "post_id": post_id,
                "user_id": viewer.id,
                "content": content,
                "parent_id": parent_id,
            }))
            .await?;

        if let Some(post) = lock(&self.state).posts.iter_mut().find(|p| p.id() == post_id) {
            post.comment_count += 1;
        }
        self.ctx.telemetry.record(
            Event::info(DOMAIN, "comment.added")
                .field("post_id", post_id)
                .field("comment_id", &row.id),
        );

        Ok(CommentView {
            comment: row,
            author,
            replies: Vec::new(),
        })
    }

    async fn upload_image(&self, blob: &Blob) -> Result<String> {
        let bucket = &self.ctx.config.post_images_bucket;
        let path = format!(
            "{}_{}.{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4(),
            extension(&blob.file_name)
        );

        self.ctx.backend.upload(bucket, &path, blob).await?;
        Ok(self.ctx.backend.public_url(bucket, &path))
    }

    /// Best effort: a failed removal is reported and the flow continues.
    async fn remove_image(&self, url: &str) {
        let bucket = &self.ctx.config.post_images_bucket;
        let Some(path) = self.ctx.backend.path_from_public_url(bucket, url) else {
            return;
        };

        if let Err(err) = self.ctx.backend.remove(bucket, vec![path.clone()]).await {
            self.ctx.telemetry.record(
                Event::warn(DOMAIN, "image.remove_failed")
                    .field("path", path)
                    .field("error", err),
            );
        }
    }

    fn require_post(&self, post_id: &str) -> Result<PostView> {
        self.post(post_id)
            .ok_or_else(|| Error::not_found("post", post_id))
    }

    fn require_owned(&self, post_id: &str, viewer: &AuthUser) -> Result<PostView> {
        let post = self.require_post(post_id)?;
        if post.post.user_id == viewer.id {
            Ok(post)
        } else {
            Err(Error::NotOwner(post_id.to_string()))
        }
    }

    fn settle<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            lock(&self.state).error = Some(err.to_string());
            self.ctx.telemetry.record(
                Event::error(DOMAIN, "operation.failed")
                    .field("operation", operation)
                    .field("error", err),
            );
        }
        result
    }
}

async fn load_feed(ctx: &StoreContext) -> Result<Vec<PostView>> {
    let page_size = ctx.config.feed_page_size;
    let rows: Vec<PostRow> = ctx
        .backend
        .from("posts")
        .order("created_at", Direction::Descending)
        .limit(page_size)
        .fetch()
        .await?;

    let viewer_id = ctx.viewer.id();
    let posts = ctx.aggregator().posts(rows, viewer_id.as_deref()).await?;
    Ok(sort_recent(posts, page_size))
}

fn replace_feed(
    ctx: &StoreContext,
    state: &Mutex<PostsState>,
    result: Result<Vec<PostView>>,
) -> Result<Arc<Vec<PostView>>> {
    let mut state = lock(state);
    match result {
        Ok(posts) => {
            ctx.telemetry
                .record(Event::new(DOMAIN, "feed.loaded").field("posts", posts.len()));
            state.posts = posts.clone();
            state.error = None;
            Ok(Arc::new(posts))
        }
        Err(err) => {
            ctx.telemetry
                .record(Event::error(DOMAIN, "feed.failed").field("error", &err));
            state.posts.clear();
            state.error = Some(err.to_string());
            Err(err)
        }
    }
}

/// Marks a post's like as pending until the last outstanding toggle drops its guard.
struct LikeLoading<'a> {
    state: &'a Mutex<PostsState>,
    post_id: String,
}

impl<'a> LikeLoading<'a> {
    fn start(state: &'a Mutex<PostsState>, post_id: &str) -> Self {
        let mut guard = lock(state);
        *guard.pending_likes.entry(post_id.to_string()).or_insert(0) += 1;
        mark_like_loading(&mut guard, post_id, true);
        LikeLoading {
            state,
            post_id: post_id.to_string(),
        }
    }
}

impl Drop for LikeLoading<'_> {
    fn drop(&mut self) {
        let mut guard = lock(self.state);
        let remaining = match guard.pending_likes.get_mut(&self.post_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            guard.pending_likes.remove(&self.post_id);
            mark_like_loading(&mut guard, &self.post_id, false);
        }
    }
}

fn mark_like_loading(state: &mut PostsState, post_id: &str, value: bool) {
    if let Some(post) = state.posts.iter_mut().find(|p| p.id() == post_id) {
        post.is_like_loading = value;
    }
}
