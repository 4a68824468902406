//! MITM proxy server.
//!
//! Wires the CA, the dispatcher and the hudsucker engine together.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use wxdl_core::{ContentRewriter, MetadataExtractor, ProfileStore, ProfileWriter, ASSET_VERSION};

use crate::assets::AssetBundle;
use crate::ca::CaManager;
use crate::dispatcher::Dispatcher;
use crate::domains::PlatformHosts;
use crate::enricher::{Enricher, HttpApiClient, DEFAULT_TIMEOUT};
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::snapshot::SnapshotWriter;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Hosts whose traffic is decrypted and processed.
    pub hosts: PlatformHosts,
    /// Root for `profiles/`, `html/` and `js/`.
    pub output_dir: PathBuf,
    /// Bootstrap and helper libraries.
    pub assets: AssetBundle,
    /// Cache-busting version appended to script references.
    pub version: String,
    /// Whether new accounts trigger enrichment calls.
    pub enrich: bool,
    /// Timeout for each enrichment call.
    pub enrich_timeout: Duration,
    /// Whether page and script snapshots are written.
    pub snapshots: bool,
}

impl ProxyConfig {
    /// Creates a configuration with the CA in the user data directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir()?;
        Ok(Self::with_ca_dir(ca_manager.ca_dir()))
    }

    /// Creates a configuration with the CA stored under `ca_dir`.
    pub fn with_ca_dir(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager: CaManager::new(ca_dir),
            hosts: PlatformHosts::default(),
            output_dir: PathBuf::from("."),
            assets: AssetBundle::new(),
            version: ASSET_VERSION.to_string(),
            enrich: true,
            enrich_timeout: DEFAULT_TIMEOUT,
            snapshots: true,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_assets(mut self, assets: AssetBundle) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the timeout for each enrichment call.
    pub fn with_enrich_timeout(mut self, timeout: Duration) -> Self {
        self.enrich_timeout = timeout;
        self
    }

    /// Disables enrichment calls.
    pub fn without_enrichment(mut self) -> Self {
        self.enrich = false;
        self
    }

    /// Disables page and script snapshots.
    pub fn without_snapshots(mut self) -> Self {
        self.snapshots = false;
        self
    }

    /// Builds the dispatcher and its collaborators.
    pub fn build_dispatcher(&self) -> Result<Dispatcher> {
        let store = Arc::new(ProfileStore::new(ProfileWriter::new(&self.output_dir)));
        let extractor = MetadataExtractor::new(store);
        let rewriter = ContentRewriter::new(&self.version, self.assets.bootstrap())?;

        let mut dispatcher = Dispatcher::new(
            self.hosts.clone(),
            self.assets.clone(),
            rewriter,
            extractor.clone(),
        );

        if self.enrich {
            let client = HttpApiClient::new(self.enrich_timeout)
                .map_err(|e| ProxyError::Http(e.to_string()))?;
            dispatcher = dispatcher.with_enricher(Enricher::new(
                Arc::new(client),
                extractor,
                self.hosts.api_host(),
            ));
        }
        if self.snapshots {
            dispatcher = dispatcher.with_snapshots(SnapshotWriter::new(&self.output_dir));
        }

        Ok(dispatcher)
    }
}

/// MITM proxy for the Channels web client.
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Creates the server, generating the CA if it does not exist yet.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.ca_manager.ensure_ca()?;
        let dispatcher = Arc::new(config.build_dispatcher()?);
        Ok(Self { config, dispatcher })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        self.dispatcher.store()
    }

    fn build_proxy(
        &self,
    ) -> Result<impl std::future::Future<Output = std::result::Result<(), hudsucker::Error>>> {
        let authority = self.config.ca_manager.ensure_ca()?;
        let handler = ProxyHandler::new(self.dispatcher.clone());

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;
        Ok(proxy.start())
    }

    /// Runs the proxy until it fails.
    pub async fn run(self) -> Result<()> {
        let proxy = self.build_proxy()?;

        tracing::info!("Starting MITM proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        proxy.await.map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.config.addr;
        let proxy = self.build_proxy()?;

        tracing::info!("Starting MITM proxy on {}", addr);

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy task to finish. Returns false if the task panicked.
    pub async fn wait(self) -> bool {
        self.handle.await.is_ok()
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) -> bool {
        self.shutdown();
        self.wait().await
    }
}
