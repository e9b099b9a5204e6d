//! Client core of a small social feed: posts, comments, likes, follows and
//! profiles served by a hosted Postgres/REST backend.
//!
//! [`state::AppState`] owns one store per domain. Stores share a
//! [`coordinator::FetchCoordinator`] per fetch so identical concurrent
//! requests hit the backend once, join records with their lookups through
//! [`aggregate::Aggregator`], and snapshot their state via
//! [`cache::PersistedCache`].

pub mod activity;
pub mod aggregate;
pub mod backend;
pub mod cache;
mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod posts;
pub mod profile;
pub mod search;
pub mod session;
pub mod state;
pub mod telemetry;

pub use config::ClientConfig;
pub use error::{BackendError, Error, Result};
pub use state::{AppState, StoreContext, Viewer};
