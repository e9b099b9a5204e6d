mod common;

use common::{ids, likes, Fixture};
use social_feed_client::cache::KeyValueStore;

#[tokio::test]
async fn trending_survives_a_restart() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.seed_posts();
    fx.backend.seed("likes", likes("p2", 3));
    let trending = fx.app.activity.fetch_trending_posts().await.unwrap();

    let restarted = fx.restart();

    assert_eq!(restarted.app.activity.trending_posts(), *trending);
    assert_eq!(ids(&restarted.app.activity.trending_posts())[0], "p2");
    assert_eq!(restarted.telemetry.count("activity", "cache.restored"), 1);
}

#[tokio::test]
async fn snapshot_is_versioned_and_prefixed() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.seed_posts();
    fx.app.search.search_posts("hello").await.unwrap();

    let text = fx.storage.get("social-feed:search").unwrap().unwrap();
    assert!(text.starts_with("v1\n"));
    assert!(text.contains("Hello world"));
}

#[tokio::test]
async fn viewer_and_search_results_are_restored() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.seed_posts();
    fx.sign_in("u1").await;
    fx.app.search.search_posts("rust").await.unwrap();
    fx.app.search.search_users("bob").await.unwrap();

    let restarted = fx.restart();

    assert_eq!(restarted.app.viewer().id().as_deref(), Some("u1"));
    assert_eq!(restarted.app.session.profile().unwrap().username, "ann");
    assert_eq!(ids(&restarted.app.search.posts()), vec!["p3", "p1"]);
    assert_eq!(restarted.app.search.users()[0].username, "bob");
}

#[tokio::test]
async fn logout_is_persisted() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.sign_in("u1").await;
    fx.app.session.logout().await.unwrap();

    let restarted = fx.restart();

    assert!(!restarted.app.session.is_authenticated());
    assert_eq!(restarted.app.viewer().current(), None);
}

#[tokio::test]
async fn corrupted_snapshots_start_empty() {
    let fx = Fixture::new();
    fx.storage.set("social-feed:activity", "v1\n{\"trending_posts\": 7}").unwrap();
    fx.storage.set("social-feed:session", "not a snapshot").unwrap();
    fx.storage.set("social-feed:search", "v2\n{}").unwrap();

    let restarted = fx.restart();

    assert!(restarted.app.activity.trending_posts().is_empty());
    assert!(restarted.app.search.posts().is_empty());
    assert!(!restarted.app.session.is_authenticated());
    assert_eq!(restarted.telemetry.count("activity", "cache.corrupted"), 1);
    assert_eq!(restarted.telemetry.count("session", "cache.corrupted"), 1);
    assert_eq!(restarted.telemetry.count("search", "cache.corrupted"), 1);
}

#[tokio::test]
async fn failed_trending_fetch_persists_the_empty_list() {
    let fx = Fixture::new();
    fx.seed_users();
    fx.seed_posts();
    fx.app.activity.fetch_trending_posts().await.unwrap();
    fx.backend.fail_on("posts", "offline");

    assert!(fx.app.activity.fetch_trending_posts().await.is_err());

    assert!(fx.app.activity.trending_posts().is_empty());
    assert!(fx.restart().app.activity.trending_posts().is_empty());
}
