use crate::error::{Error, Result};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_FEED_PAGE_SIZE: usize = 50;
pub const DEFAULT_TRENDING_LIMIT: usize = 20;
pub const DEFAULT_TRENDING_WINDOW: usize = 100;
pub const DEFAULT_AGGREGATE_CONCURRENCY: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the hosted backend, without a trailing slash.
    pub backend_url: String,
    pub api_key: String,
    pub post_images_bucket: String,
    pub avatars_bucket: String,
    pub feed_page_size: usize,
    pub trending_limit: usize,
    /// Number of most recent posts considered for trending.
    pub trending_window: usize,
    /// Records aggregated concurrently within one batch.
    pub aggregate_concurrency: usize,
    pub cache_key_prefix: String,
    /// Directory of the file-backed persisted cache; in-memory when unset.
    pub cache_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(backend_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let backend_url: String = backend_url.into();
        ClientConfig {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            post_images_bucket: "post-images".to_string(),
            avatars_bucket: "avatars".to_string(),
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
            trending_limit: DEFAULT_TRENDING_LIMIT,
            trending_window: DEFAULT_TRENDING_WINDOW,
            aggregate_concurrency: DEFAULT_AGGREGATE_CONCURRENCY,
            cache_key_prefix: "social-feed".to_string(),
            cache_dir: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = ClientConfig::new(required("SUPABASE_URL")?, required("SUPABASE_ANON_KEY")?);

        Ok(ClientConfig {
            post_images_bucket: try_load("POST_IMAGES_BUCKET", defaults.post_images_bucket)?,
            avatars_bucket: try_load("AVATARS_BUCKET", defaults.avatars_bucket)?,
            feed_page_size: positive("FEED_PAGE_SIZE", defaults.feed_page_size)?,
            trending_limit: positive("TRENDING_LIMIT", defaults.trending_limit)?,
            trending_window: positive("TRENDING_WINDOW", defaults.trending_window)?,
            aggregate_concurrency: positive(
                "AGGREGATE_CONCURRENCY",
                defaults.aggregate_concurrency,
            )?,
            cache_key_prefix: try_load("CACHE_KEY_PREFIX", defaults.cache_key_prefix)?,
            cache_dir: var("CACHE_DIR").map(PathBuf::from),
            ..defaults
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> Result<String> {
    var(key).ok_or_else(|| Error::Config(format!("{key} is not set")))
}

fn try_load<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {key} value: {e}"))),
        None => {
            log::info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn positive(key: &str, default: usize) -> Result<usize> {
    let value: usize = try_load(key, default)?;
    if value == 0 {
        Err(Error::Config(format!("{key} must be greater than 0")))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_defaults_and_trims_url() {
        let config = ClientConfig::new("https://demo.supabase.co/", "anon");
        assert_eq!(config.backend_url, "https://demo.supabase.co");
        assert_eq!(config.post_images_bucket, "post-images");
        assert_eq!(config.avatars_bucket, "avatars");
        assert_eq!(config.feed_page_size, DEFAULT_FEED_PAGE_SIZE);
        assert_eq!(config.trending_limit, 20);
        assert_eq!(config.trending_window, 100);
        assert!(config.cache_dir.is_none());
    }
}
