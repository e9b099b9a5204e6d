mod common;

use common::Fixture;
use social_feed_client::model::{Blob, ProfileUpdate};
use social_feed_client::Error;
use std::time::Duration;

#[tokio::test]
async fn concurrent_profile_fetches_are_shared_per_user() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.backend.set_latency(Duration::from_millis(2));

    let profile = &fx.app.profile;
    let (a, b) = tokio::join!(profile.fetch_profile("u2"), profile.fetch_profile("u2"));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fx.backend.call_count("select:profiles"), 1);
    assert_eq!(fx.app.profile.profile().unwrap().username, "bob");
    assert!(!fx.app.profile.loading());
}

#[tokio::test]
async fn failed_fetch_clears_the_profile() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.app.profile.fetch_profile("u1").await.unwrap();

    let err = fx.app.profile.fetch_profile("nobody").await.unwrap_err();

    assert_eq!(err.backend_code(), Some("PGRST116"));
    assert_eq!(fx.app.profile.profile(), None);
    assert_eq!(fx.restart().app.profile.profile(), None);
}

#[tokio::test]
async fn update_writes_fields_and_persists() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.app.profile.fetch_profile("u3").await.unwrap();

    let updated = fx
        .app
        .profile
        .update_profile(ProfileUpdate {
            full_name: Some("Cyd Cooper".to_string()),
            username: "cyd".to_string(),
            bio: Some("hi".to_string()),
            avatar_url: None,
        })
        .await
        .unwrap();

    assert_eq!(updated.full_name.as_deref(), Some("Cyd Cooper"));
    assert!(updated.updated_at.is_some());
    assert_eq!(fx.backend.rows("profiles")[2]["bio"], "hi");
    assert_eq!(fx.restart().app.profile.profile(), Some(updated));
}

#[tokio::test]
async fn update_needs_a_loaded_profile() {
    let fx = Fixture::new();

    let err = fx
        .app
        .profile
        .update_profile(ProfileUpdate::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { kind: "profile", .. }));
    assert!(fx.backend.calls().is_empty());
}

#[tokio::test]
async fn avatar_upload_points_profile_at_the_new_file() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.app.profile.fetch_profile("u1").await.unwrap();

    let updated = fx
        .app
        .profile
        .upload_avatar(Blob::new("me.JPG", "image/jpeg", vec![0xff, 0xd8]))
        .await
        .unwrap();

    let paths = fx.backend.blob_paths("avatars");
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with("u1/"));
    assert!(paths[0].ends_with(".jpg"));
    assert_eq!(
        updated.avatar_url,
        Some(format!("memory://storage/avatars/{}", paths[0]))
    );
    assert_eq!(updated.username, "ann");
    assert_eq!(updated.full_name.as_deref(), Some("Ann Archer"));
}

#[tokio::test]
async fn clear_profile_forgets_it() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.app.profile.fetch_profile("u1").await.unwrap();

    fx.app.profile.clear_profile();

    assert_eq!(fx.app.profile.profile(), None);
}
