//! RPC server and graceful shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start/serve──▶ Listening ──signal/stop──▶ Draining ──▶ Stopped
//! ```
//!
//! On SIGTERM, SIGQUIT, Ctrl-C or [`StopHandle::stop`] the server:
//! 1. Stops accepting and drops the listener.
//! 2. Asks every open connection to finish its in-flight calls and close.
//! 3. Waits up to the drain grace, then aborts whatever is left.
//! 4. Flushes the profiling session and closes the store.
//!
//! SIGHUP is logged and otherwise ignored; configuration is read once.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::call::Call;
use crate::chain::Chain;
use crate::context::CallContext;
use crate::error::Error;
use crate::handler::BoxedHandler;
use crate::metadata::{Metadata, TIMEOUT};
use crate::profiling::ProfilingSession;
use crate::reply::{self, HttpResponse};
use crate::router::Router;
use crate::status::Status;
use crate::store::ApplyStore;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Where a [`Server`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Draining,
    Stopped,
}

/// Requests a graceful stop from outside the serve loop.
///
/// A stop requested before the server starts listening takes effect as soon
/// as it does.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<Notify>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.notify_one();
    }
}

/// The RPC server: one chain, one router, many connections.
pub struct Server {
    chain: Arc<Chain>,
    router: Arc<Router>,
    drain_grace: Duration,
    store: Option<Arc<dyn ApplyStore>>,
    profiling: Option<ProfilingSession>,
    state: watch::Sender<ServerState>,
    stop: Arc<Notify>,
}

impl Server {
    pub fn new(chain: Chain, router: Router) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            chain: Arc::new(chain),
            router: Arc::new(router),
            drain_grace: DEFAULT_DRAIN_GRACE,
            store: None,
            profiling: None,
            state,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Store to close once the server has drained.
    pub fn with_store(mut self, store: Arc<dyn ApplyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Profiling session to finish once the server has drained.
    pub fn with_profiling(mut self, session: ProfilingSession) -> Self {
        self.profiling = Some(session);
        self
    }

    /// How long in-flight connections get after shutdown starts.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Watches lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Binds `addr` and serves until a termination signal or a stop request.
    ///
    /// ```rust,no_run
    /// # async fn run(server: applyd::Server) -> Result<(), applyd::Error> {
    /// server.start("0.0.0.0:5000").await
    /// # }
    /// ```
    pub async fn start(self, addr: &str) -> Result<(), Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::Address(addr.to_owned()))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::bind(addr, e))?;
        self.serve(listener, terminate_signal()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves or a
    /// stop is requested, then drains.
    pub async fn serve<F>(mut self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        self.state.send_replace(ServerState::Listening);
        info!(%addr, methods = self.router.methods().len(), stages = ?self.chain.stage_names(), "applyd listening");

        // Every connection task lands in the JoinSet so draining can wait for
        // exactly the connections that are still open.
        let mut tasks = JoinSet::new();
        let mut accepted: u64 = 0;
        let mut hangup = Hangup::install();

        // `select!` polls the shutdown future by reference on every turn of the
        // loop, so it has to stay put in memory: pin it on the stack.
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Arms are checked top to bottom. A pending shutdown or stop wins
                // over a queued connection, so nothing new is accepted once
                // either has fired.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received");
                    break;
                }

                () = self.stop.notified() => {
                    info!(in_flight = tasks.len(), "stop requested");
                    break;
                }

                () = hangup.recv() => {
                    info!("SIGHUP received, configuration is only read at startup");
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    accepted += 1;
                    tasks.spawn(connection(
                        stream,
                        peer,
                        Arc::clone(&self.chain),
                        Arc::clone(&self.router),
                        self.state.subscribe(),
                    ));
                }

                // Reap finished connections so the set stays as large as the
                // number of open sockets, not the number ever accepted.
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!("connection task failed: {e}");
                    }
                }
            }
        }

        // Flipping the state is what tells each connection task to start its
        // graceful shutdown; see `connection`. Dropping the listener refuses
        // new sockets at the kernel instead of leaving them queued.
        self.state.send_replace(ServerState::Draining);
        drop(listener);

        let drained = tokio::time::timeout(self.drain_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        // Past the grace period, abort: a stuck handler must not hold the
        // process past its termination window.
        if drained.is_err() {
            warn!(remaining = tasks.len(), grace = ?self.drain_grace, "drain grace elapsed, aborting connections");
            tasks.shutdown().await;
        }

        if let Some(session) = self.profiling.take() {
            if let Err(e) = session.record("connections_accepted", accepted) {
                warn!("profiling sample: {e}");
            }
            if let Err(e) = session.finish() {
                warn!("profiling finish: {e}");
            }
        }
        if let Some(store) = self.store.take() {
            store.close();
        }

        self.state.send_replace(ServerState::Stopped);
        info!(accepted, "applyd stopped");
        Ok(())
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

async fn connection(
    stream: TcpStream,
    peer: SocketAddr,
    chain: Arc<Chain>,
    router: Arc<Router>,
    state: watch::Receiver<ServerState>,
) {
    // `service_fn` runs once per request on this connection. Each request gets
    // its own handles on the shared chain and router.
    let svc = service_fn(move |req| {
        let chain = Arc::clone(&chain);
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(dispatch(&chain, &router, req, peer).await) }
    });

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new());
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(KEEPALIVE_INTERVAL))
        .keep_alive_timeout(KEEPALIVE_TIMEOUT);

    // `graceful_shutdown` needs `Pin<&mut Connection>` while the connection
    // is still being polled by the other arm, so it is pinned up front.
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(%peer, "connection error: {e}");
            }
        }
        () = draining(state) => {
            // Finishes the in-flight request, then closes: HTTP/1.1 stops
            // keep-alive, HTTP/2 sends GOAWAY.
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(%peer, "connection error while draining: {e}");
            }
        }
    }
}

/// Resolves once the server leaves [`ServerState::Listening`].
async fn draining(mut state: watch::Receiver<ServerState>) {
    let _ = state.wait_for(|s| *s != ServerState::Listening).await;
}

// ── Request dispatch ─────────────────────────────────────────────────────────

/// Decodes one HTTP request into a [`Call`], runs it through the chain and
/// encodes the reply. Transport failures are answered without entering the
/// chain.
async fn dispatch(chain: &Chain, router: &Router, req: hyper::Request<Incoming>, peer: SocketAddr) -> HttpResponse {
    match decode(router, req, peer).await {
        Ok((call, handler)) => reply::encode(chain.invoke(call, &handler).await),
        Err(status) => {
            debug!(%peer, code = %status.code(), error = %status.message(), "request rejected by transport");
            reply::encode(Err(status))
        }
    }
}

async fn decode(
    router: &Router,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> Result<(Call, BoxedHandler), Status> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_owned();

    if parts.method != Method::POST {
        return Err(Status::unimplemented(format!("{} {path}: calls must use POST", parts.method)));
    }
    let handler = router
        .lookup(&path)
        .ok_or_else(|| Status::unimplemented(format!("unknown method {path}")))?;

    let metadata: Metadata = parts
        .headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_owned())))
        .collect();

    let context = match metadata.get(TIMEOUT) {
        Some(raw) => {
            let timeout = parse_timeout(raw)
                .ok_or_else(|| Status::invalid_argument(format!("malformed {TIMEOUT} `{raw}`")))?;
            CallContext::with_timeout(timeout)
        }
        None => CallContext::new(),
    };

    let bytes = body
        .collect()
        .await
        .map_err(|e| Status::invalid_argument(format!("read request body: {e}")))?
        .to_bytes();
    let payload = if bytes.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&bytes).map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))?
    };

    let call = Call::new(path, payload)
        .with_peer(peer)
        .with_metadata(metadata)
        .with_context(context);
    Ok((call, handler))
}

/// Parses a `grpc-timeout` value: up to eight digits and a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub(crate) fn parse_timeout(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at_checked(raw.len().checked_sub(1)?)?;
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(n * 3600),
        "M" => Duration::from_secs(n * 60),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(timeout)
}

// ── Signals ──────────────────────────────────────────────────────────────────

/// Resolves on the first termination signal the process receives.
///
/// SIGTERM comes from the orchestrator, SIGQUIT and Ctrl-C from an operator.
/// A handler that cannot be installed is logged and never fires.
async fn terminate_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let (sigterm, sigquit) = {
        use tokio::signal::unix::SignalKind;
        (unix_signal(SignalKind::terminate(), "SIGTERM"), unix_signal(SignalKind::quit(), "SIGQUIT"))
    };

    #[cfg(not(unix))]
    let (sigterm, sigquit) = (std::future::pending::<()>(), std::future::pending::<()>());

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
        () = sigquit => {}
    }
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, name: &'static str) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            error!("{name} handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// SIGHUP listener. Never fires where SIGHUP does not exist.
struct Hangup {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Hangup {
    #[cfg(unix)]
    fn install() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        let signal = signal(SignalKind::hangup())
            .inspect_err(|e| warn!("SIGHUP handler: {e}"))
            .ok();
        Self { signal }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
