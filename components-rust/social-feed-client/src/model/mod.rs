use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Columns of a profile attached to posts and comments.
pub const PROFILE_SUMMARY_COLUMNS: &str = "id,username,full_name,avatar_url";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostRow {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub user_id: String,
    pub content: String,
    pub created_at: Timestamp,
}

impl CommentRow {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl From<Profile> for ProfileSummary {
    fn from(profile: Profile) -> Self {
        ProfileSummary {
            id: profile.id,
            username: profile.username,
            full_name: profile.full_name,
            avatar_url: profile.avatar_url,
        }
    }
}

/// A post joined with its author and the viewer-relative counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostView {
    #[serde(flatten)]
    pub post: PostRow,
    pub author: ProfileSummary,
    pub like_count: u64,
    pub comment_count: u64,
    /// Whether the viewer liked the post when it was fetched.
    pub liked: bool,
    #[serde(default, skip_serializing)]
    pub is_like_loading: bool,
}

impl PostView {
    pub fn new(post: PostRow, author: ProfileSummary) -> Self {
        PostView {
            post,
            author,
            like_count: 0,
            comment_count: 0,
            liked: false,
            is_like_loading: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.post.id
    }

    /// Flips `liked` and moves `like_count` by one, never below zero.
    pub fn apply_like(&mut self, liked: bool) {
        self.liked = liked;
        self.like_count = if liked {
            self.like_count.saturating_add(1)
        } else {
            self.like_count.saturating_sub(1)
        };
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentView {
    #[serde(flatten)]
    pub comment: CommentRow,
    pub author: ProfileSummary,
    #[serde(default)]
    pub replies: Vec<CommentView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub follower_id: String,
    pub following_id: String,
}

impl FollowEdge {
    pub fn new(follower_id: impl Into<String>, following_id: impl Into<String>) -> Result<Self> {
        let follower_id = follower_id.into();
        let following_id = following_id.into();
        if following_id.is_empty() {
            Err(Error::MissingTarget)
        } else if follower_id == following_id {
            Err(Error::SelfFollow)
        } else {
            Ok(FollowEdge {
                follower_id,
                following_id,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeRow {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
}

/// Projection of a row to its identity column.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RowId {
    pub id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCounts {
    pub comment_count: u64,
    pub like_count: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowCounts {
    pub followers_count: u64,
    pub following_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        AuthUser {
            id: id.into(),
            email,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: AuthUser,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignUp {
    pub user: Option<AuthUser>,
    pub session: Option<Session>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthChange {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

/// File content to place in blob storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Blob {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Blob {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ImageChange {
    #[default]
    Keep,
    Replace(Blob),
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPost {
    pub content: String,
    pub image: Option<Blob>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostUpdate {
    pub content: String,
    pub image: ImageChange,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub username: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}
