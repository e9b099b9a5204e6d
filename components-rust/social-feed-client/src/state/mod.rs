use crate::activity::ActivityStore;
use crate::aggregate::Aggregator;
use crate::backend::{Backend, RestBackend};
use crate::cache::{FileStore, KeyValueStore, MemoryStore, PersistedCache};
use crate::common::sync::lock;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::model::AuthUser;
use crate::posts::PostsStore;
use crate::profile::ProfileStore;
use crate::search::SearchStore;
use crate::session::SessionStore;
use crate::telemetry::{LogTelemetry, Telemetry};
use std::sync::{Arc, Mutex};

/// The signed-in account, shared by every store. Written only by the session store.
#[derive(Clone, Debug, Default)]
pub struct Viewer {
    user: Arc<Mutex<Option<AuthUser>>>,
}

impl Viewer {
    pub fn current(&self) -> Option<AuthUser> {
        lock(&self.user).clone()
    }

    pub fn id(&self) -> Option<String> {
        lock(&self.user).as_ref().map(|u| u.id.clone())
    }

    pub fn require(&self) -> Result<AuthUser> {
        self.current().ok_or(Error::NotAuthenticated)
    }

    pub(crate) fn set(&self, user: Option<AuthUser>) {
        *lock(&self.user) = user;
    }
}

/// Collaborators handed to each store at construction.
#[derive(Clone)]
pub struct StoreContext {
    pub backend: Arc<dyn Backend>,
    pub telemetry: Arc<dyn Telemetry>,
    pub config: Arc<ClientConfig>,
    pub viewer: Viewer,
    pub cache: PersistedCache,
}

impl StoreContext {
    pub fn new(
        config: Arc<ClientConfig>,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn KeyValueStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let cache = PersistedCache::new(storage, config.cache_key_prefix.clone(), telemetry.clone());
        StoreContext {
            backend,
            telemetry,
            config,
            viewer: Viewer::default(),
            cache,
        }
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.backend.clone(), self.config.aggregate_concurrency)
    }
}

/// Application state: one instance per process, passed by reference to
/// whatever needs a store.
pub struct AppState {
    pub context: StoreContext,
    pub session: SessionStore,
    pub posts: PostsStore,
    pub profile: ProfileStore,
    pub activity: ActivityStore,
    pub search: SearchStore,
}

impl AppState {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn KeyValueStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let context = StoreContext::new(Arc::new(config), backend, storage, telemetry);

        AppState {
            session: SessionStore::new(context.clone()),
            posts: PostsStore::new(context.clone()),
            profile: ProfileStore::new(context.clone()),
            activity: ActivityStore::new(context.clone()),
            search: SearchStore::new(context.clone()),
            context,
        }
    }

    /// Wires the HTTP backend, the configured cache storage and `log` output.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = Arc::new(RestBackend::new(&config));
        let storage: Arc<dyn KeyValueStore> = match &config.cache_dir {
            Some(dir) => Arc::new(FileStore::new(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(AppState::new(config, backend, storage, Arc::new(LogTelemetry)))
    }

    pub fn viewer(&self) -> &Viewer {
        &self.context.viewer
    }
}
