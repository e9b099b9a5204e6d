//! Joins primary records with their per-record lookups into view models.
//!
//! Each record fans out into independent lookups issued together and fanned
//! back in; records run with bounded concurrency and the output keeps the
//! input order. The first failing lookup fails the whole batch.

use crate::backend::{Backend, BackendExt, Direction};
use crate::error::Result;
use crate::model::{CommentRow, CommentView, PostRow, PostView, ProfileSummary, PROFILE_SUMMARY_COLUMNS};
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::try_join;
use std::sync::Arc;

#[derive(Clone)]
pub struct Aggregator {
    backend: Arc<dyn Backend>,
    concurrency: usize,
}

impl Aggregator {
    pub fn new(backend: Arc<dyn Backend>, concurrency: usize) -> Self {
        Aggregator {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn profile_summary(&self, user_id: &str) -> Result<ProfileSummary> {
        self.backend
            .from("profiles")
            .columns(PROFILE_SUMMARY_COLUMNS)
            .eq("id", user_id)
            .single()
            .await
    }

    pub async fn like_count(&self, post_id: &str) -> Result<u64> {
        self.backend.from("likes").eq("post_id", post_id).count().await
    }

    pub async fn comment_count(&self, post_id: &str) -> Result<u64> {
        self.backend
            .from("comments")
            .eq("post_id", post_id)
            .count()
            .await
    }

    /// Whether a like row exists for (post, viewer); false without a viewer.
    pub async fn liked_by(&self, post_id: &str, viewer_id: Option<&str>) -> Result<bool> {
        match viewer_id {
            Some(viewer_id) => {
                let like: Option<serde_json::Value> = self
                    .backend
                    .from("likes")
                    .columns("id")
                    .eq("post_id", post_id)
                    .eq("user_id", viewer_id)
                    .maybe_single()
                    .await?;
                Ok(like.is_some())
            }
            None => Ok(false),
        }
    }

    pub async fn post(&self, post: PostRow, viewer_id: Option<&str>) -> Result<PostView> {
        let (author, like_count, comment_count, liked) = try_join!(
            self.profile_summary(&post.user_id),
            self.like_count(&post.id),
            self.comment_count(&post.id),
            self.liked_by(&post.id, viewer_id),
        )?;

        Ok(PostView {
            post,
            author,
            like_count,
            comment_count,
            liked,
            is_like_loading: false,
        })
    }

    pub async fn posts(&self, posts: Vec<PostRow>, viewer_id: Option<&str>) -> Result<Vec<PostView>> {
        stream::iter(posts)
            .map(|post| self.post(post, viewer_id))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    pub async fn comment(&self, comment: CommentRow) -> Result<CommentView> {
        let author = self.profile_summary(&comment.user_id).await?;
        Ok(CommentView {
            comment,
            author,
            replies: Vec::new(),
        })
    }

    /// A top-level comment with its author and its replies (oldest first).
    pub async fn thread(&self, comment: CommentRow) -> Result<CommentView> {
        let (author, replies) = try_join!(
            self.profile_summary(&comment.user_id),
            self.replies(&comment.id),
        )?;
        Ok(CommentView {
            comment,
            author,
            replies,
        })
    }

    async fn replies(&self, parent_id: &str) -> Result<Vec<CommentView>> {
        let rows: Vec<CommentRow> = self
            .backend
            .from("comments")
            .eq("parent_id", parent_id)
            .order("created_at", Direction::Ascending)
            .fetch()
            .await?;

        stream::iter(rows)
            .map(|reply| self.comment(reply))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    pub async fn threads(&self, comments: Vec<CommentRow>) -> Result<Vec<CommentView>> {
        stream::iter(comments)
            .map(|comment| self.thread(comment))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }
}

/// Most liked first (stable for equal counts), capped at `limit`.
pub fn sort_trending(mut posts: Vec<PostView>, limit: usize) -> Vec<PostView> {
    posts.sort_by(|a, b| b.like_count.cmp(&a.like_count));
    posts.truncate(limit);
    posts
}

/// Newest first, capped at `limit`.
pub fn sort_recent(mut posts: Vec<PostView>, limit: usize) -> Vec<PostView> {
    posts.sort_by(|a, b| a.post.created_at.cmp(&b.post.created_at).reverse());
    posts.truncate(limit);
    posts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn view(id: &str, likes: u64, day: u32) -> PostView {
        let mut view = PostView::new(
            PostRow {
                id: id.to_string(),
                user_id: "u".to_string(),
                content: String::new(),
                image_url: None,
                created_at: chrono::Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
                updated_at: None,
            },
            ProfileSummary {
                id: "u".to_string(),
                username: "u".to_string(),
                full_name: None,
                avatar_url: None,
            },
        );
        view.like_count = likes;
        view
    }

    fn ids(posts: &[PostView]) -> Vec<&str> {
        posts.iter().map(|p| p.id()).collect()
    }

    #[test]
    fn trending_sort_is_stable_and_capped() {
        let posts = vec![view("a", 5, 1), view("b", 1, 2), view("c", 9, 3), view("d", 5, 4)];
        let sorted = sort_trending(posts, 3);
        assert_eq!(ids(&sorted), vec!["c", "a", "d"]);
    }

    #[test]
    fn recent_sort_newest_first() {
        let posts = vec![view("a", 0, 1), view("b", 0, 3), view("c", 0, 2)];
        let sorted = sort_recent(posts, 2);
        assert_eq!(ids(&sorted), vec!["b", "c"]);
    }
}
