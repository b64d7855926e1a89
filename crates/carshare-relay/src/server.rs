//! TCP relay server for carshare terminals

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::{get, Router},
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use carshare_core::auth::StoreAuthenticator;
use carshare_core::sqlite_store::SqliteStore;
use carshare_core::{BookingService, BookingStore};

use crate::admin::AdminApi;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::framing::{FrameCodec, FramingError};
use crate::metrics::RelayMetrics;
use crate::protocol::{ProtocolError, Request};

/// Stops a running [`RelayServer`].
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// TCP relay server
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    codec: FrameCodec,
    dispatcher: Arc<Dispatcher>,
    booking: Arc<BookingService<dyn BookingStore>>,
    metrics: Arc<RelayMetrics>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RelayServer {
    /// Create a relay server backed by the SQLite database named in `config`.
    pub async fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::with_pool_size(&config.database_path, config.database_pool_size)
            .with_context(|| {
                format!("Failed to open booking database {:?}", config.database_path)
            })?;
        info!("Booking database opened at {:?}", config.database_path);
        Self::with_store(config, Arc::new(store)).await
    }

    /// Create a relay server over an existing store and bind its listener.
    pub async fn with_store<S: BookingStore + 'static>(
        config: RelayConfig,
        store: Arc<S>,
    ) -> Result<Self> {
        config.validate()?;

        let shared: Arc<dyn BookingStore> = store.clone();
        let booking = Arc::new(BookingService::new(shared.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            booking.clone(),
            Arc::new(StoreAuthenticator::new(shared)),
            store,
        ));
        let metrics = Arc::new(RelayMetrics::new()?);

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        let codec = FrameCodec::new(config.framing, config.max_message_size)
            .with_idle_timeout(config.raw_idle_timeout());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            listener,
            codec,
            dispatcher,
            booking,
            metrics,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Address the terminal listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Run the relay server until Ctrl-C or [`ShutdownHandle::shutdown`].
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting relay server on {} ({} framing)",
            self.listener.local_addr()?,
            self.codec.mode()
        );

        if let Some(admin_addr) = self.config.admin_addr {
            self.start_http(admin_addr).await?;
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut signals_enabled = true;
        let mut connections = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown requested, starting graceful shutdown");
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.metrics.record_connection_opened();
                        let codec = self.codec;
                        let dispatcher = self.dispatcher.clone();
                        let metrics = self.metrics.clone();
                        let request_timeout = self.config.request_timeout();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(
                                stream,
                                peer,
                                codec,
                                dispatcher,
                                metrics.clone(),
                                request_timeout,
                            )
                            .await
                            {
                                error!("Connection error from {}: {:#}", peer, e);
                                metrics.record_handler_error();
                            }
                            metrics.record_connection_closed();
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                result = &mut ctrl_c, if signals_enabled => {
                    match result {
                        Ok(()) => {
                            info!("Shutdown signal received, starting graceful shutdown");
                            let _ = self.shutdown.send(true);
                            break;
                        }
                        Err(e) => {
                            warn!("Failed to install Ctrl-C handler: {}", e);
                            signals_enabled = false;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown requested, starting graceful shutdown");
                        break;
                    }
                }
            }
        }

        // Stop accepting before draining
        let shutdown_timeout = self.config.shutdown_timeout();
        drop(self);
        graceful_shutdown(connections, shutdown_timeout).await;

        info!("Shutting down relay server");
        Ok(())
    }

    /// Serve health, metrics and admin endpoints.
    async fn start_http(&self, addr: SocketAddr) -> Result<()> {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics.clone());

        if let Some(admin_token) = &self.config.admin_token {
            let admin_api = AdminApi::new(
                self.booking.clone(),
                self.metrics.clone(),
                admin_token.clone(),
            );
            router = router.merge(admin_api.router());
            info!("Admin API enabled on {}", addr);
        }

        let router = router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin address {}", addr))?;
        info!("HTTP server for health/metrics listening on {}", addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let stop = async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop)
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });
        Ok(())
    }
}

/// Wait for in-flight connections, up to `shutdown_timeout`.
async fn graceful_shutdown(mut connections: JoinSet<()>, shutdown_timeout: Duration) {
    let active = connections.len();
    if active > 0 {
        info!("Waiting for {} connections to finish...", active);
    }

    let drained = timeout(shutdown_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "Shutdown timeout reached, aborting {} connections",
            connections.len()
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Serve one request/reply exchange on a terminal connection.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<RelayMetrics>,
    request_timeout: Duration,
) -> Result<()> {
    debug!("New connection from {}", peer);

    let message = match timeout(request_timeout, codec.read_request(&mut stream)).await {
        Err(_) => return Err(anyhow!("timed out waiting for request")),
        Ok(Err(FramingError::Io(e))) => return Err(e).context("failed to read request"),
        Ok(Err(e)) => {
            metrics.record_protocol_error();
            warn!("Rejecting request from {}: {}", peer, protocol_error(e));
            return Ok(());
        }
        Ok(Ok(None)) => {
            debug!("Connection from {} closed without a request", peer);
            return Ok(());
        }
        Ok(Ok(Some(message))) => message,
    };

    let request = match Request::parse(&message) {
        Ok(request) => request,
        Err(e) => {
            metrics.record_protocol_error();
            warn!("Rejecting request from {}: {}", peer, e);
            return Ok(());
        }
    };
    let tag = request.tag();
    debug!("Request from {}: {:?}", peer, request);

    let started = Instant::now();
    let reply = tokio::select! {
        result = timeout(request_timeout, dispatcher.dispatch(request)) => {
            result.map_err(|_| anyhow!("{} request timed out", tag))??
        }
        _ = peer_reset(&stream) => {
            debug!("Connection from {} reset mid-request, {} abandoned", peer, tag);
            metrics.record_abandoned_request();
            return Ok(());
        }
    };

    let wire = reply.to_wire();
    timeout(request_timeout, codec.write_message(&mut stream, &wire))
        .await
        .map_err(|_| anyhow!("timed out writing reply"))?
        .context("failed to write reply")?;

    metrics.record_request(tag, reply.is_failure(), started.elapsed());
    debug!("Replied to {} {} with {:?}", peer, tag, wire);
    Ok(())
}

/// Resolves once the peer has reset the connection.
///
/// A half-close (`peek` returning 0) is how a terminal says its request is
/// complete, and it is still waiting for the reply, so that never resolves.
async fn peer_reset(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    if stream.peek(&mut byte).await.is_ok() {
        // EOF or trailing bytes: the peer is still there
        std::future::pending::<()>().await;
    }
}

fn protocol_error(e: FramingError) -> ProtocolError {
    match e {
        FramingError::TooLarge(size, max) => ProtocolError::Oversize(size, max),
        other => ProtocolError::Malformed(other.to_string()),
    }
}

/// Health check handler
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Metrics export handler
async fn metrics_handler(
    State(metrics): State<Arc<RelayMetrics>>,
) -> Result<Response<String>, StatusCode> {
    match metrics.export() {
        Ok(body) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
