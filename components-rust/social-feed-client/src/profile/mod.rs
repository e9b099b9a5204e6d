use crate::backend::BackendExt;
use crate::common::blob::extension;
use crate::common::sync::lock;
use crate::coordinator::{Activity, FetchCoordinator};
use crate::error::{Error, Result};
use crate::model::{Blob, Profile, ProfileUpdate};
use crate::state::StoreContext;
use crate::telemetry::Event;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const DOMAIN: &str = "profile";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ProfileSnapshot {
    profile: Option<Profile>,
}

/// The profile currently on screen, which need not be the viewer's.
pub struct ProfileStore {
    ctx: StoreContext,
    state: Arc<Mutex<ProfileSnapshot>>,
    fetches: FetchCoordinator<String, Profile>,
    activity: Activity,
}

impl ProfileStore {
    pub fn new(ctx: StoreContext) -> Self {
        let snapshot: ProfileSnapshot = ctx.cache.load(DOMAIN);
        ProfileStore {
            fetches: FetchCoordinator::new(DOMAIN, ctx.telemetry.clone()),
            activity: Activity::new(),
            state: Arc::new(Mutex::new(snapshot)),
            ctx,
        }
    }

    pub fn profile(&self) -> Option<Profile> {
        lock(&self.state).profile.clone()
    }

    pub fn loading(&self) -> bool {
        self.fetches.is_loading() || self.activity.is_active()
    }

    /// Loads and keeps the profile of `user_id`. A failed load clears it.
    pub async fn fetch_profile(&self, user_id: &str) -> Result<Profile> {
        let ctx = self.ctx.clone();
        let state = self.state.clone();
        let key = user_id.to_string();

        self.fetches
            .fetch(key.clone(), move || async move {
                let result: Result<Profile> = ctx
                    .backend
                    .from("profiles")
                    .eq("id", key.as_str())
                    .single()
                    .await;
                store_profile(&ctx, &state, result.as_ref().ok().cloned());
                if let Err(err) = &result {
                    ctx.telemetry.record(
                        Event::error(DOMAIN, "fetch.profile_failed")
                            .field("user_id", &key)
                            .field("error", err),
                    );
                }
                result
            })
            .await
    }

    pub fn clear_profile(&self) {
        store_profile(&self.ctx, &self.state, None);
    }

    /// Writes the editable fields of the loaded profile.
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Profile> {
        let _active = self.activity.start();
        let current = self.require_profile()?;

        let patch = serde_json::json!({
            "full_name": update.full_name,
            "username": update.username,
            "bio": update.bio,
            "avatar_url": update.avatar_url,
            "updated_at": chrono::Utc::now(),
        });
        let profile: Profile = self
            .ctx
            .backend
            .from("profiles")
            .eq("id", current.id.as_str())
            .update_single(&patch)
            .await?;

        store_profile(&self.ctx, &self.state, Some(profile.clone()));
        self.ctx
            .telemetry
            .record(Event::info(DOMAIN, "profile.updated").field("user_id", &profile.id));
        Ok(profile)
    }

    /// Stores a new avatar and points the loaded profile at it.
    pub async fn upload_avatar(&self, blob: Blob) -> Result<Profile> {
        let current = self.require_profile()?;
        let bucket = self.ctx.config.avatars_bucket.clone();
        let path = format!(
            "{}/{}.{}",
            current.id,
            uuid::Uuid::new_v4(),
            extension(&blob.file_name)
        );

        {
            let _active = self.activity.start();
            self.ctx.backend.upload(&bucket, &path, &blob).await?;
        }
        let avatar_url = self.ctx.backend.public_url(&bucket, &path);

        self.update_profile(ProfileUpdate {
            full_name: current.full_name,
            username: current.username,
            bio: current.bio,
            avatar_url: Some(avatar_url),
        })
        .await
    }

    fn require_profile(&self) -> Result<Profile> {
        self.profile()
            .ok_or_else(|| Error::not_found("profile", "current"))
    }
}

fn store_profile(ctx: &StoreContext, state: &Mutex<ProfileSnapshot>, profile: Option<Profile>) {
    let snapshot = {
        let mut state = lock(state);
        state.profile = profile;
        state.clone()
    };
    ctx.cache.save(DOMAIN, &snapshot);
}
