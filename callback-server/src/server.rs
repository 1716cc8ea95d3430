//! HTTP server for receiving UPnP event notifications.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use warp::http::{Method, StatusCode};
use warp::Filter;

use crate::error::ServerError;
use crate::router::{EventRouter, NotificationPayload};

/// Where the callback server binds and what address it advertises.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Inclusive port range tried in order; `(0, 0)` lets the OS choose
    pub port_range: (u16, u16),
    /// Address devices should call back on. Detected from the default
    /// route when unset.
    pub advertise_ip: Option<IpAddr>,
    /// Local interface to bind
    pub bind_ip: IpAddr,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            port_range: (3400, 3500),
            advertise_ip: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl CallbackConfig {
    /// Loopback-only server, used when devices are simulated locally
    pub fn loopback() -> Self {
        Self {
            port_range: (0, 0),
            advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// HTTP callback server for receiving UPnP event notifications.
///
/// The `CallbackServer` binds to a local port and accepts UPnP NOTIFY
/// requests on any path. It validates UPnP headers and routes events through
/// an `EventRouter` to a channel. Events for subscription IDs the router does
/// not know are answered with 412 and dropped, unless a subscription is
/// still in flight on that path.
///
/// # Example
///
/// ```no_run
/// use tokio::sync::mpsc;
/// use callback_server::{CallbackConfig, CallbackServer, NotificationPayload};
///
/// #[tokio::main]
/// async fn main() {
///     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
///
///     let server = CallbackServer::new(CallbackConfig::default(), tx)
///         .await
///         .expect("Failed to create callback server");
///
///     println!("Server listening at: {}", server.base_url());
///
///     while let Some(notification) = rx.recv().await {
///         println!("Received event for subscription: {}", notification.subscription_id);
///     }
/// }
/// ```
pub struct CallbackServer {
    /// The port the server is bound to
    port: u16,
    /// The base URL for callback registration
    base_url: String,
    /// Event router for handling incoming events
    event_router: Arc<EventRouter>,
    shutdown: CancellationToken,
    server_handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the first free port in the configured range and start serving.
    pub async fn new(
        config: CallbackConfig,
        event_sender: mpsc::UnboundedSender<NotificationPayload>,
    ) -> Result<Self, ServerError> {
        let advertise_ip = match config.advertise_ip {
            Some(ip) => ip,
            None => Self::detect_local_ip().ok_or(ServerError::NoLocalAddress)?,
        };

        let event_router = Arc::new(EventRouter::new(event_sender));
        let routes = notify_route(event_router.clone()).recover(handle_rejection);
        let shutdown = CancellationToken::new();

        let (start, end) = config.port_range;
        let mut bound = None;
        for port in start..=end {
            let signal = shutdown.clone();
            let addr = SocketAddr::new(config.bind_ip, port);
            match warp::serve(routes.clone())
                .try_bind_with_graceful_shutdown(addr, async move { signal.cancelled().await })
            {
                Ok(server) => {
                    bound = Some(server);
                    break;
                }
                Err(e) => trace!(port, error = %e, "callback port unavailable"),
            }
        }
        let (addr, server) = bound.ok_or(ServerError::NoAvailablePort { start, end })?;

        let port = addr.port();
        let base_url = format!("http://{}:{}", advertise_ip, port);
        let server_handle = tokio::spawn(server);
        info!(%addr, %base_url, "callback server listening");

        Ok(Self {
            port,
            base_url,
            event_router,
            shutdown,
            server_handle: Some(server_handle),
        })
    }

    /// Get the base URL devices should call back on
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full callback URL for a path below the base URL
    pub fn callback_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Stop accepting requests and wait for the server task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        debug!(port = self.port, "callback server stopped");
    }

    fn detect_local_ip() -> Option<IpAddr> {
        // Connecting a UDP socket sends nothing; it only resolves the route
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    fn validate_upnp_headers(
        sid: &Option<String>,
        nt: &Option<String>,
        nts: &Option<String>,
    ) -> bool {
        // SID header is required for event notifications
        if sid.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return false;
        }

        // NT and NTS are optional, but must carry the event values if present
        if let Some(nt) = nt {
            if nt.trim() != "upnp:event" {
                return false;
            }
        }
        if let Some(nts) = nts {
            if nts.trim() != "upnp:propchange" {
                return false;
            }
        }

        true
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// NOTIFY endpoint that accepts any path.
fn notify_route(
    router: Arc<EventRouter>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::header::optional::<String>("sid"))
        .and(warp::header::optional::<String>("nt"))
        .and(warp::header::optional::<String>("nts"))
        .and(warp::header::optional::<String>("seq"))
        .and(warp::body::bytes())
        .and_then(
            move |method: Method,
                  path: warp::path::FullPath,
                  sid: Option<String>,
                  nt: Option<String>,
                  nts: Option<String>,
                  seq: Option<String>,
                  body: Bytes| {
                let router = router.clone();
                async move {
                    if method.as_str() != "NOTIFY" {
                        return Err(warp::reject::custom(MethodNotAllowed));
                    }

                    if !CallbackServer::validate_upnp_headers(&sid, &nt, &nts) {
                        warn!(path = path.as_str(), "rejecting NOTIFY with invalid UPnP headers");
                        return Err(warp::reject::custom(InvalidUpnpHeaders));
                    }
                    let subscription_id = sid.unwrap_or_default().trim().to_string();

                    let Some(seq) = seq.as_deref().and_then(|s| s.trim().parse::<u32>().ok())
                    else {
                        warn!(sid = %subscription_id, "rejecting NOTIFY without a valid SEQ");
                        return Err(warp::reject::custom(InvalidUpnpHeaders));
                    };

                    let event_xml = String::from_utf8_lossy(&body).into_owned();
                    debug!(
                        sid = %subscription_id,
                        seq,
                        path = path.as_str(),
                        bytes = body.len(),
                        "received NOTIFY"
                    );

                    let payload = NotificationPayload {
                        subscription_id: subscription_id.clone(),
                        seq,
                        path: path.as_str().to_string(),
                        event_xml,
                    };

                    if router.route_event(payload).await {
                        Ok(warp::reply::with_status("", StatusCode::OK))
                    } else {
                        warn!(sid = %subscription_id, seq, "NOTIFY for unknown subscription");
                        Err(warp::reject::custom(UnknownSubscription))
                    }
                }
            },
        )
}

#[derive(Debug)]
struct InvalidUpnpHeaders;

impl warp::reject::Reject for InvalidUpnpHeaders {}

#[derive(Debug)]
struct UnknownSubscription;

impl warp::reject::Reject for UnknownSubscription {}

#[derive(Debug)]
struct MethodNotAllowed;

impl warp::reject::Reject for MethodNotAllowed {}

async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if err.find::<UnknownSubscription>().is_some() {
        (StatusCode::PRECONDITION_FAILED, "Subscription not found")
    } else if err.find::<InvalidUpnpHeaders>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid UPnP headers")
    } else if err.find::<MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Only NOTIFY is accepted")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(warp::reply::with_status(message, code))
}
