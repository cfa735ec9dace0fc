//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. The gateway serves two
//! listeners: the proxy ingress, where every path is routed to a backend, and
//! the registry listener carrying the registration protocol and management
//! endpoints. Keeping them apart means no backend path is ever shadowed by a
//! gateway endpoint.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Args;
use crate::proxy::{LoadBalancer, Proxy};
use crate::registry::{HeartbeatMonitor, InstanceRegistry};
use crate::routes;
use crate::routing::{Route, SharedTable, TableBuilder};
use crate::types::{GatewayError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub registry: Arc<InstanceRegistry>,
    pub table: SharedTable,
    pub proxy: Arc<Proxy>,
    pub started_at: Instant,
}

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Surface {
    Proxy,
    Registry,
}

/// A running gateway: background tasks plus both listeners
pub struct Gateway {
    state: Arc<AppState>,
    proxy_addr: SocketAddr,
    registry_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Load the configured routes, then start as [`Gateway::start_with_routes`]
    pub async fn start(args: Args) -> Result<Self> {
        let routes = args.load_routes()?;
        Self::start_with_routes(args, routes).await
    }

    /// Compose registry, monitor, table builder and proxy over already
    /// resolved `routes`, bind both listeners and start serving
    pub async fn start_with_routes(args: Args, routes: Vec<Route>) -> Result<Self> {
        let registry = Arc::new(InstanceRegistry::new(args.lease_duration()));
        let monitor = HeartbeatMonitor::new(Arc::clone(&registry), args.monitor_config());
        let builder = TableBuilder::new(routes, Arc::clone(&registry), args.rebuild_interval());
        let balancer = Arc::new(LoadBalancer::new(args.lb_policy));
        let proxy = Arc::new(Proxy::new(builder.table(), balancer, args.max_body_bytes)?);

        let proxy_listener = TcpListener::bind(args.listen).await?;
        let registry_listener = TcpListener::bind(args.registry_listen).await?;
        let proxy_addr = proxy_listener.local_addr()?;
        let registry_addr = registry_listener.local_addr()?;

        let state = Arc::new(AppState {
            table: builder.table(),
            args,
            registry,
            proxy,
            started_at: Instant::now(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            monitor.spawn(shutdown_rx.clone()),
            builder.spawn(shutdown_rx.clone()),
            tokio::spawn(serve(
                proxy_listener,
                Surface::Proxy,
                Arc::clone(&state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(serve(
                registry_listener,
                Surface::Registry,
                Arc::clone(&state),
                shutdown_rx,
            )),
        ];

        info!(
            node_id = %state.args.node_id,
            proxy = %proxy_addr,
            registry = %registry_addr,
            "Gateway listening"
        );

        Ok(Self {
            state,
            proxy_addr,
            registry_addr,
            shutdown,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Bound proxy ingress address
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Bound registry and management address
    pub fn registry_addr(&self) -> SocketAddr {
        self.registry_addr
    }

    /// Stop accepting connections and wait for background tasks
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Gateway task ended abnormally: {}", e);
            }
        }
        info!("Gateway shutdown completed");
    }
}

/// Run the gateway until SIGINT/SIGTERM
pub async fn run(args: Args, routes: Vec<Route>) -> Result<()> {
    let gateway = Gateway::start_with_routes(args, routes).await?;
    shutdown_signal().await;
    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Accept loop for one listener
async fn serve(
    listener: TcpListener,
    surface: Surface,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move {
                                let response = match surface {
                                    Surface::Proxy => state.proxy.handle(req, Some(addr)).await,
                                    Surface::Registry => handle_registry_request(state, addr, req).await,
                                };
                                Ok::<_, hyper::Error>(response)
                            }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(?surface, "Listener stopped");
                    break;
                }
            }
        }
    }
}

/// Percent-decoded path segments
fn path_segments(path: &str) -> Result<Vec<String>> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|_| GatewayError::BadRequest(format!("Invalid path encoding: {}", path)))
        })
        .collect()
}

/// Route requests on the registry listener
async fn handle_registry_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let segments = match path_segments(&path) {
        Ok(segments) => segments,
        Err(err) => return err.to_response(&path),
    };
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let registry = state.registry.as_ref();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) | (&Method::GET, ["healthz"]) => {
            Ok(routes::health_check(&state))
        }
        (&Method::GET, ["ready"]) | (&Method::GET, ["readyz"]) => {
            Ok(routes::readiness_check(&state))
        }
        (&Method::GET, ["version"]) => Ok(routes::version_info()),
        (&Method::GET, ["routes"]) => Ok(routes::routing_table(&state.table)),

        (&Method::POST, ["registry", "instances"]) => {
            routes::register_instance(registry, req).await
        }
        (&Method::PUT, ["registry", "instances", service, id, "heartbeat"]) => {
            routes::renew_lease(registry, service, id)
        }
        (&Method::PUT, ["registry", "instances", service, id, "status"]) => {
            routes::update_status(registry, service, id, req.uri().query())
        }
        (&Method::DELETE, ["registry", "instances", service, id]) => {
            routes::deregister_instance(registry, service, id)
        }
        (&Method::GET, ["registry", "services"]) => Ok(routes::list_services(registry)),
        (&Method::GET, ["registry", "services", service]) => {
            Ok(routes::service_instances(registry, service))
        }

        _ => Err(GatewayError::NotFound(format!("{} {}", method, path))),
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            debug!(path = %path, error = %err, "Registry request failed");
            err.to_response(&path)
        }
    }
}
