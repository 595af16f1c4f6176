//! Engine assembly.
//!
//! [`InterceptEngine`] owns the async runtime and every shared component:
//! the connection pool, the response cache, the host filter, the trust
//! anchors, and the handles to the embedder's session and discard
//! registries. Connections borrow all of it through one `Arc`.

use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::base::{EngineConfig, NetError};
use crate::cache::ResponseCache;
use crate::connection::StreamConnection;
use crate::filter::HostFilter;
use crate::session::{DiscardRegistry, SessionId, SessionStore};
use crate::socket::pool::ConnectionPool;
use crate::trust::TrustAnchors;

pub struct InterceptEngine {
    runtime: tokio::runtime::Runtime,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) cache: ResponseCache,
    pub(crate) filter: HostFilter,
    pub(crate) trust: Option<TrustAnchors>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) discards: Arc<dyn DiscardRegistry>,
    pub(crate) config: EngineConfig,
}

impl InterceptEngine {
    /// Build an engine: start the runtime, load the blocklist, bootstrap
    /// the trust store, and start the pool's prune task.
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        discards: Arc<dyn DiscardRegistry>,
    ) -> Result<Arc<Self>, NetError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("streamnet-io")
            .build()
            .map_err(|_| NetError::EngineStartFailed)?;

        let filter = if !config.block_ads {
            HostFilter::disabled()
        } else {
            match &config.blocklist_path {
                Some(path) => HostFilter::from_file(path),
                None => HostFilter::bundled(),
            }
        };

        let trust = config
            .pem_source
            .as_deref()
            .and_then(|source| TrustAnchors::bootstrap(source, &config.cache_dir, runtime.handle()));

        let pool = Arc::new(ConnectionPool::new(
            config.max_route_connections,
            config.max_total_connections,
        ));
        pool.start_prune_task(runtime.handle());

        info!(
            max_route = config.max_route_connections,
            block_ads = config.block_ads,
            custom_trust = trust.is_some(),
            "engine started"
        );
        Ok(Arc::new(Self {
            runtime,
            pool,
            cache: ResponseCache::new(),
            filter,
            trust,
            sessions,
            discards,
            config,
        }))
    }

    /// Open a connection for one exchange. The URL must be http or https;
    /// the session must be known to the store.
    pub fn open(self: &Arc<Self>, url: &str, session: SessionId) -> Result<StreamConnection, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(NetError::InvalidUrl);
        }
        url.host_str().ok_or(NetError::InvalidUrl)?;
        let settings = self.sessions.settings(session).ok_or(NetError::UnknownSession)?;
        Ok(StreamConnection::new(Arc::clone(self), url, session, &settings))
    }

    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    /// Drive an exchange future from the calling (blocking) thread.
    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
