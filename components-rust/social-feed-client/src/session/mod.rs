//! The signed-in viewer: authentication, the viewer's profile and follow edges.

use crate::backend::BackendExt;
use crate::common::sync::lock;
use crate::coordinator::{Activity, KeyedSerializer};
use crate::error::{Error, Result};
use crate::model::{AuthChange, AuthUser, FollowCounts, FollowEdge, Profile, RowId, Session};
use crate::state::StoreContext;
use crate::telemetry::Event;
use email_address::EmailAddress;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

const DOMAIN: &str = "session";

const EMAIL_NOT_CONFIRMED: &str = "Email not confirmed";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionSnapshot {
    user: Option<AuthUser>,
    profile: Option<Profile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    SignedIn(AuthUser),
    /// The account exists but cannot sign in until the email is confirmed.
    ConfirmationPending(AuthUser),
}

pub struct SessionStore {
    ctx: StoreContext,
    state: Arc<Mutex<SessionSnapshot>>,
    activity: Activity,
    follows: KeyedSerializer<(String, String)>,
}

impl SessionStore {
    /// Rehydrates the last persisted viewer.
    pub fn new(ctx: StoreContext) -> Self {
        let snapshot: SessionSnapshot = ctx.cache.load(DOMAIN);
        ctx.viewer.set(snapshot.user.clone());

        SessionStore {
            ctx,
            state: Arc::new(Mutex::new(snapshot)),
            activity: Activity::new(),
            follows: KeyedSerializer::new(),
        }
    }

    pub fn user(&self) -> Option<AuthUser> {
        lock(&self.state).user.clone()
    }

    pub fn profile(&self) -> Option<Profile> {
        lock(&self.state).profile.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.state).user.is_some()
    }

    pub fn loading(&self) -> bool {
        self.activity.is_active()
    }

    /// Adopts the session the backend currently holds, if any.
    pub async fn init(&self) -> Result<()> {
        let _active = self.activity.start();

        match self.ctx.backend.get_session().await {
            Ok(Some(session)) => self.signed_in(session.user).await,
            Ok(None) => self.signed_out(),
            Err(err) => {
                self.signed_out();
                return Err(self.failed("init", err.into()));
            }
        }
        Ok(())
    }

    pub async fn handle_auth_change(&self, change: AuthChange) {
        self.ctx
            .telemetry
            .record(Event::new(DOMAIN, "auth.changed").field("change", change_name(&change)));

        match change {
            AuthChange::SignedIn(session) | AuthChange::TokenRefreshed(session) => {
                self.signed_in(session.user).await
            }
            AuthChange::SignedOut => self.signed_out(),
        }
    }

    /// Follows the backend's auth notifications until the stream ends.
    pub async fn watch_auth_changes(&self) {
        let mut changes = self.ctx.backend.auth_changes();
        while let Some(change) = changes.next().await {
            self.handle_auth_change(change).await;
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthUser> {
        let _active = self.activity.start();
        let email = valid_email(email)?;

        let session: Session = self
            .ctx
            .backend
            .sign_in_with_password(&email, password)
            .await
            .map_err(|err| self.failed("login", err.into()))?;

        self.signed_in(session.user.clone()).await;
        self.ctx
            .telemetry
            .record(Event::info(DOMAIN, "login.succeeded").field("user_id", &session.user.id));
        Ok(session.user)
    }

    /// Creates the account and signs it in. Accounts awaiting email confirmation
    /// become the viewer without a backend session.
    pub async fn register(&self, email: &str, password: &str, username: &str) -> Result<Registration> {
        let _active = self.activity.start();
        let email = valid_email(email)?;

        let sign_up = self
            .ctx
            .backend
            .sign_up(&email, password, username)
            .await
            .map_err(|err| self.failed("register", err.into()))?;

        match self.ctx.backend.sign_in_with_password(&email, password).await {
            Ok(session) => {
                self.signed_in(session.user.clone()).await;
                Ok(Registration::SignedIn(session.user))
            }
            Err(err) if err.message.contains(EMAIL_NOT_CONFIRMED) => {
                let user = sign_up
                    .user
                    .ok_or_else(|| self.failed("register", err.into()))?;
                self.set_user(Some(user.clone()));
                self.ctx.telemetry.record(
                    Event::info(DOMAIN, "registration.confirmation_pending")
                        .field("user_id", &user.id),
                );
                Ok(Registration::ConfirmationPending(user))
            }
            Err(err) => Err(self.failed("register", err.into())),
        }
    }

    pub async fn logout(&self) -> Result<()> {
        let _active = self.activity.start();
        let result = self.ctx.backend.sign_out().await;
        self.signed_out();
        result.map_err(|err| self.failed("logout", err.into()))
    }

    /// Loads a profile; the viewer's own profile (the default) is also kept.
    pub async fn fetch_profile(&self, user_id: Option<&str>) -> Result<Profile> {
        let viewer = self.ctx.viewer.id();
        let Some(user_id) = user_id.map(str::to_string).or(viewer.clone()) else {
            return Err(Error::NotAuthenticated);
        };

        let profile: Profile = self
            .ctx
            .backend
            .from("profiles")
            .eq("id", user_id.as_str())
            .single()
            .await
            .map_err(|err| self.failed("fetch_profile", err))?;

        if viewer.as_deref() == Some(user_id.as_str()) {
            self.update(|state| state.profile = Some(profile.clone()));
        }
        Ok(profile)
    }

    /// Follower and following totals; unreadable counts are zero.
    pub async fn fetch_follow_counts(&self, user_id: &str) -> FollowCounts {
        if user_id.is_empty() {
            return FollowCounts::default();
        }

        let backend = &self.ctx.backend;
        let counts = futures::try_join!(
            backend.from("follows").eq("following_id", user_id).count(),
            backend.from("follows").eq("follower_id", user_id).count(),
        );

        match counts {
            Ok((followers_count, following_count)) => FollowCounts {
                followers_count,
                following_count,
            },
            Err(err) => {
                self.ctx.telemetry.record(
                    Event::warn(DOMAIN, "follow_counts.failed")
                        .field("user_id", user_id)
                        .field("error", err),
                );
                FollowCounts::default()
            }
        }
    }

    pub async fn is_following(&self, target_id: &str) -> bool {
        let Some(viewer_id) = self.ctx.viewer.id() else {
            return false;
        };
        if target_id.is_empty() {
            return false;
        }

        match self.follow_row(&viewer_id, target_id).await {
            Ok(row) => row.is_some(),
            Err(err) => {
                self.ctx.telemetry.record(
                    Event::warn(DOMAIN, "is_following.failed")
                        .field("target_id", target_id)
                        .field("error", err),
                );
                false
            }
        }
    }

    /// Follows or unfollows `target_id`; returns whether the viewer now follows it.
    pub async fn toggle_follow(&self, target_id: &str) -> Result<bool> {
        let viewer = self.ctx.viewer.require()?;
        let edge = FollowEdge::new(viewer.id.clone(), target_id)?;

        let _turn = self
            .follows
            .acquire((edge.follower_id.clone(), edge.following_id.clone()))
            .await;
        let _active = self.activity.start();

        let result = self.flip_follow(&edge).await;
        match &result {
            Ok(following) => self.ctx.telemetry.record(
                Event::info(DOMAIN, "follow.toggled")
                    .field("target_id", target_id)
                    .field("following", following),
            ),
            Err(err) => {
                self.failed("toggle_follow", err.clone());
            }
        }
        result
    }

    async fn flip_follow(&self, edge: &FollowEdge) -> Result<bool> {
        match self.follow_row(&edge.follower_id, &edge.following_id).await? {
            Some(row) => {
                self.ctx
                    .backend
                    .from("follows")
                    .eq("id", row.id)
                    .delete()
                    .await?;
                Ok(false)
            }
            None => {
                let _: Value = self.ctx.backend.from("follows").insert(edge).await?;
                Ok(true)
            }
        }
    }

    async fn follow_row(&self, follower_id: &str, following_id: &str) -> Result<Option<RowId>> {
        self.ctx
            .backend
            .from("follows")
            .columns("id")
            .eq("follower_id", follower_id)
            .eq("following_id", following_id)
            .maybe_single()
            .await
    }

    async fn signed_in(&self, user: AuthUser) {
        let user_id = user.id.clone();
        self.set_user(Some(user));

        if let Err(err) = self.fetch_profile(Some(&user_id)).await {
            self.ctx.telemetry.record(
                Event::warn(DOMAIN, "profile.unavailable")
                    .field("user_id", &user_id)
                    .field("error", err),
            );
        }
    }

    fn signed_out(&self) {
        self.ctx.viewer.set(None);
        self.update(|state| {
            state.user = None;
            state.profile = None;
        });
    }

    fn set_user(&self, user: Option<AuthUser>) {
        self.ctx.viewer.set(user.clone());
        self.update(|state| {
            if state.user.as_ref().map(|u| &u.id) != user.as_ref().map(|u| &u.id) {
                state.profile = None;
            }
            state.user = user;
        });
    }

    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let snapshot = {
            let mut state = lock(&self.state);
            f(&mut state);
            state.clone()
        };
        self.ctx.cache.save(DOMAIN, &snapshot);
    }

    fn failed(&self, operation: &'static str, err: Error) -> Error {
        self.ctx.telemetry.record(
            Event::error(DOMAIN, "operation.failed")
                .field("operation", operation)
                .field("error", &err),
        );
        err
    }
}

fn valid_email(email: &str) -> Result<String> {
    let email = email.trim();
    EmailAddress::from_str(email)
        .map(|_| email.to_string())
        .map_err(|_| Error::InvalidEmail(email.to_string()))
}

fn change_name(change: &AuthChange) -> &'static str {
    match change {
        AuthChange::SignedIn(_) => "signed_in",
        AuthChange::TokenRefreshed(_) => "token_refreshed",
        AuthChange::SignedOut => "signed_out",
    }
}
