//! Self-healing client connection.
//!
//! A [`Connection`] dials through a [`ConnectionTransport`], reconnects with
//! backoff whenever the stream dies, and retries commands its handler marks
//! as throttled. Callers go through [`Connection::do_command`] (or the
//! [`ConnectionClient`] from [`Connection::get_client`]) and never see a
//! dropped connection unless reconnecting itself fails for good.
//!
//! All concurrent waiters share one reconnect attempt. The attempt records
//! its outcome before waking them, then clears itself so the next failure
//! starts fresh.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rmpv::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{default_backoff_factory, retry_notify, BackoffFactory};
use crate::client::{Client, ErrorUnwrapper, GenericClient, StringErrorUnwrapper};
use crate::config::TransportConfig;
use crate::context::Context;
use crate::dispatch::TagsFunc;
use crate::error::{Result, RpcError};
use crate::message::CompressionType;
use crate::protocol::{Protocol, WrapErrorFunc};
use crate::server::Server;
use crate::transport::Transport;

/// Dials transports for a [`Connection`].
///
/// `dial` stages a new transport; `finalize` promotes the staged one to
/// active once the handler accepted it, closing whatever was active before.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    async fn dial(&self, ctx: &Context) -> Result<Transport>;

    /// Whether the active transport is still up.
    fn is_connected(&self) -> bool;

    fn finalize(&self);

    /// Closes the active and staged transports.
    async fn close(&self);
}

/// Callbacks a [`Connection`] makes as it connects, fails and retries.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Runs right after each dial, before the transport becomes active.
    /// An error fails the attempt.
    async fn on_connect(
        &self,
        ctx: &Context,
        conn: &Connection,
        client: &Client,
        server: &Server,
    ) -> Result<()>;

    fn on_connect_error(&self, err: &RpcError, reconnect_throttle: Duration);

    fn on_do_command_error(&self, err: &RpcError, next_time: Duration);

    fn on_disconnected(&self, ctx: &Context, status: DisconnectStatus);

    /// Whether `err` from command `name` is a throttle to retry with backoff.
    fn should_retry(&self, name: &str, err: &RpcError) -> bool;

    /// Whether a failed connect attempt should be tried again.
    fn should_retry_on_connect(&self, err: &RpcError) -> bool;

    fn handler_name(&self) -> &str;
}

/// How a reconnect attempt began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectStatus {
    UsingExistingConnection = 1,
    StartingFirstConnection = 2,
    StartingNonFirstConnection = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

/// Yields the window a non-first reconnect waits within before dialing.
pub type BackoffWindowFunc = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Options for [`Connection::new`].
#[derive(Clone)]
pub struct ConnectionOpts {
    /// Tags attached to every outgoing call.
    pub tags: Option<TagsFunc>,
    /// Registered on the server side of every dialed transport.
    pub protocols: Vec<Protocol>,
    /// Skip the eager connect at construction; the first command dials.
    pub dont_connect_now: bool,
    pub wrap_error: Option<WrapErrorFunc>,
    /// Defaults to exponential backoff that never gives up.
    pub reconnect_backoff: Option<BackoffFactory>,
    /// Backoff for throttled commands. Same default.
    pub command_backoff: Option<BackoffFactory>,
    pub initial_reconnect_backoff_window: Option<BackoffWindowFunc>,
    /// Treat the first connect as a reconnect, so it waits out the window.
    pub force_initial_backoff: bool,
    /// Connect timeout for the provided TCP and TLS transports.
    pub dialer_timeout: Option<Duration>,
    pub disable_sigpipe: bool,
    pub transport_config: TransportConfig,
}

impl Default for ConnectionOpts {
    fn default() -> Self {
        Self {
            tags: None,
            protocols: Vec::new(),
            dont_connect_now: false,
            wrap_error: None,
            reconnect_backoff: None,
            command_backoff: None,
            initial_reconnect_backoff_window: None,
            force_initial_backoff: false,
            dialer_timeout: None,
            disable_sigpipe: false,
            transport_config: TransportConfig::default(),
        }
    }
}

impl fmt::Debug for ConnectionOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOpts")
            .field("protocols", &self.protocols.len())
            .field("dont_connect_now", &self.dont_connect_now)
            .field("force_initial_backoff", &self.force_initial_backoff)
            .field("dialer_timeout", &self.dialer_timeout)
            .field("disable_sigpipe", &self.disable_sigpipe)
            .field("transport_config", &self.transport_config)
            .finish_non_exhaustive()
    }
}

/// Errors that mean the stream died under a command, which is worth
/// another try on a fresh connection.
pub fn check_for_retry(err: &RpcError) -> bool {
    err.is_eof()
}

#[derive(Clone)]
struct ReconnectSignal {
    done: CancellationToken,
    err: Arc<Mutex<Option<RpcError>>>,
}

impl ReconnectSignal {
    fn new() -> Self {
        Self {
            done: CancellationToken::new(),
            err: Arc::new(Mutex::new(None)),
        }
    }

    fn same(&self, other: &ReconnectSignal) -> bool {
        Arc::ptr_eq(&self.err, &other.err)
    }

    fn finish(&self, err: Option<RpcError>) {
        *self.err.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    async fn wait(&self, ctx: &Context) -> Result<()> {
        tokio::select! {
            e = ctx.done() => Err(e),
            _ = self.done.cancelled() => {
                match self.err.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}

struct ReconnectAttempt {
    signal: ReconnectSignal,
    cancel: CancellationToken,
}

/// A random wait that can be cut short.
#[derive(Default)]
struct RandomTimer {
    armed: Mutex<Option<CancellationToken>>,
}

struct ArmedTimer {
    wait: Duration,
    fired: CancellationToken,
}

impl RandomTimer {
    fn arm(&self, window: Duration) -> ArmedTimer {
        let wait = if window.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..window)
        };
        let fired = CancellationToken::new();
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(fired.clone());
        ArmedTimer { wait, fired }
    }

    fn fire_now(&self) {
        if let Some(fired) = self.armed.lock().unwrap_or_else(PoisonError::into_inner).take() {
            fired.cancel();
        }
    }
}

struct Shared {
    client: Option<Client>,
    server: Option<Server>,
    reconnect: Option<ReconnectAttempt>,
    reconnected_before: bool,
    shut_down: bool,
}

struct ConnectionInner {
    handler: Arc<dyn ConnectionHandler>,
    transport: Arc<dyn ConnectionTransport>,
    unwrapper: Arc<dyn ErrorUnwrapper>,
    reconnect_backoff: BackoffFactory,
    command_backoff: BackoffFactory,
    wrap_error: Option<WrapErrorFunc>,
    tags: Option<TagsFunc>,
    protocols: Vec<Protocol>,
    initial_window: Option<BackoffWindowFunc>,
    timer: RandomTimer,
    shared: Mutex<Shared>,
}

/// Client connection that reconnects and retries on its own.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handler", &self.inner.handler.handler_name())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Builds a connection over `transport`. Unless `opts.dont_connect_now`
    /// is set, the first connect starts right away, which needs a running
    /// tokio runtime.
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        transport: Arc<dyn ConnectionTransport>,
        unwrapper: Option<Arc<dyn ErrorUnwrapper>>,
        opts: ConnectionOpts,
    ) -> Self {
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                handler,
                transport,
                unwrapper: unwrapper.unwrap_or_else(|| Arc::new(StringErrorUnwrapper)),
                reconnect_backoff: opts.reconnect_backoff.unwrap_or_else(default_backoff_factory),
                command_backoff: opts.command_backoff.unwrap_or_else(default_backoff_factory),
                wrap_error: opts.wrap_error,
                tags: opts.tags,
                protocols: opts.protocols,
                initial_window: opts.initial_reconnect_backoff_window,
                timer: RandomTimer::default(),
                shared: Mutex::new(Shared {
                    client: None,
                    server: None,
                    reconnect: None,
                    reconnected_before: opts.force_initial_backoff,
                    shut_down: false,
                }),
            }),
        };
        if !opts.dont_connect_now {
            let mut shared = conn.lock();
            conn.reconnect_signal_locked(&mut shared);
        }
        conn
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected_locked(&self, shared: &Shared) -> bool {
        shared.client.is_some() && self.inner.transport.is_connected()
    }

    pub fn is_connected(&self) -> bool {
        let shared = self.lock();
        !shared.shut_down && self.is_connected_locked(&shared)
    }

    pub fn state(&self) -> ConnectionState {
        let shared = self.lock();
        if shared.shut_down {
            ConnectionState::ShutDown
        } else if self.is_connected_locked(&shared) {
            ConnectionState::Connected
        } else if shared.reconnect.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn handler_name(&self) -> &str {
        self.inner.handler.handler_name()
    }

    /// Runs `rpc_fn` against a live client, reconnecting first if needed.
    ///
    /// Errors the handler's `should_retry` accepts are retried with the
    /// command backoff on the same client. An end-of-stream error after that
    /// loops back to reconnect and runs `rpc_fn` again. Anything else is
    /// returned as is.
    pub async fn do_command<T, F, Fut>(&self, ctx: &Context, name: &str, rpc_fn: F) -> Result<T>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.inner.initial_window.is_some() && ctx.is_fire_now() {
            self.inner.timer.fire_now();
        }
        let handler = self.inner.handler.as_ref();
        let rpc_fn = &rpc_fn;
        loop {
            self.wait_for_connection_inner(ctx, false).await?;
            let Some(client) = self.lock().client.clone() else {
                continue;
            };

            let mut backoff = (self.inner.command_backoff)();
            let outcome = retry_notify(
                ctx,
                backoff.as_mut(),
                || {
                    let fut = rpc_fn(client.clone());
                    async move {
                        match fut.await {
                            Err(e) if handler.should_retry(name, &e) => Err(e),
                            other => Ok(other),
                        }
                    }
                },
                |err, wait| handler.on_do_command_error(err, wait),
            )
            .await;

            match outcome {
                Err(throttled) => return Err(throttled),
                Ok(Err(e)) if check_for_retry(&e) => {
                    debug!(
                        handler = handler.handler_name(),
                        command = name,
                        error = %e,
                        "connection lost during command, retrying"
                    );
                }
                Ok(result) => return result,
            }
        }
    }

    /// Returns once connected, joining or starting a reconnect if needed.
    pub async fn wait_for_connection(&self, ctx: &Context) -> Result<()> {
        self.wait_for_connection_inner(ctx, false).await
    }

    /// Reconnects even if the current transport looks healthy.
    pub async fn force_reconnect(&self, ctx: &Context) -> Result<()> {
        self.wait_for_connection_inner(ctx, true).await
    }

    async fn wait_for_connection_inner(&self, ctx: &Context, force: bool) -> Result<()> {
        let signal = {
            let mut shared = self.lock();
            if shared.shut_down {
                return Err(RpcError::Shutdown);
            }
            if !force && self.is_connected_locked(&shared) {
                return Ok(());
            }
            let (signal, status) = self.reconnect_signal_locked(&mut shared);
            debug!(
                handler = self.handler_name(),
                status = ?status,
                "waiting for connection"
            );
            signal
        };
        if self.inner.initial_window.is_some() && ctx.is_fire_now() {
            self.inner.timer.fire_now();
        }
        signal.wait(ctx).await
    }

    fn reconnect_signal_locked(&self, shared: &mut Shared) -> (ReconnectSignal, DisconnectStatus) {
        if let Some(attempt) = &shared.reconnect {
            return (
                attempt.signal.clone(),
                DisconnectStatus::UsingExistingConnection,
            );
        }

        let status = if shared.reconnected_before {
            DisconnectStatus::StartingNonFirstConnection
        } else {
            shared.reconnected_before = true;
            DisconnectStatus::StartingFirstConnection
        };
        let delay = match &self.inner.initial_window {
            Some(window) if status == DisconnectStatus::StartingNonFirstConnection => {
                Some(self.inner.timer.arm(window()))
            }
            _ => None,
        };

        let signal = ReconnectSignal::new();
        let cancel = CancellationToken::new();
        shared.reconnect = Some(ReconnectAttempt {
            signal: signal.clone(),
            cancel: cancel.clone(),
        });

        let conn = self.clone();
        let task_signal = signal.clone();
        tokio::spawn(async move {
            conn.do_reconnect(Context::from_token(cancel), status, delay, task_signal)
                .await;
        });
        (signal, status)
    }

    async fn do_reconnect(
        &self,
        ctx: Context,
        status: DisconnectStatus,
        delay: Option<ArmedTimer>,
        signal: ReconnectSignal,
    ) {
        let handler = self.inner.handler.as_ref();
        handler.on_disconnected(&ctx, status);

        if let Some(timer) = delay {
            info!(
                handler = handler.handler_name(),
                wait_ms = timer.wait.as_millis() as u64,
                "waiting before reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(timer.wait) => {}
                _ = timer.fired.cancelled() => {
                    debug!(handler = handler.handler_name(), "reconnect wait fast-forwarded");
                }
                _ = ctx.done() => {}
            }
        }

        let mut backoff = (self.inner.reconnect_backoff)();
        let this = self;
        let ctx_ref = &ctx;
        let outcome = retry_notify(
            &ctx,
            backoff.as_mut(),
            move || async move {
                if let Some(e) = ctx_ref.err() {
                    return Ok(Err(e));
                }
                match this.connect(ctx_ref).await {
                    Ok(()) => Ok(Ok(())),
                    Err(e) if handler.should_retry_on_connect(&e) => Err(e),
                    Err(e) => Ok(Err(e)),
                }
            },
            |err, wait| handler.on_connect_error(err, wait),
        )
        .await;

        let err = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) | Err(e) => Some(e),
        };
        if let Some(e) = &err {
            warn!(handler = handler.handler_name(), error = %e, "giving up on reconnect");
        }
        signal.finish(err);

        {
            let mut shared = self.lock();
            if matches!(&shared.reconnect, Some(a) if a.signal.same(&signal)) {
                shared.reconnect = None;
            }
        }
        signal.done.cancel();
    }

    async fn connect(&self, ctx: &Context) -> Result<()> {
        let handler = self.inner.handler.as_ref();
        debug!(handler = handler.handler_name(), "dialing");
        let transport = self.inner.transport.dial(ctx).await.map_err(|e| {
            warn!(handler = handler.handler_name(), error = %e, "dial failed");
            e
        })?;

        let client = Client::new(
            &transport,
            Some(self.inner.unwrapper.clone()),
            self.inner.tags.clone(),
        );
        let server = Server::new(&transport, self.inner.wrap_error.clone());
        for protocol in &self.inner.protocols {
            if let Err(e) = server.register(protocol.clone()) {
                transport.close().await;
                return Err(e);
            }
        }

        if let Err(e) = handler.on_connect(ctx, self, &client, &server).await {
            warn!(handler = handler.handler_name(), error = %e, "on_connect failed");
            transport.close().await;
            return Err(e);
        }

        let shut_down = {
            let mut shared = self.lock();
            if !shared.shut_down {
                shared.client = Some(client);
                shared.server = Some(server);
                self.inner.transport.finalize();
            }
            shared.shut_down
        };
        if shut_down {
            transport.close().await;
            return Err(RpcError::Shutdown);
        }
        info!(handler = handler.handler_name(), "connected");
        Ok(())
    }

    /// A client whose every call goes through [`Connection::do_command`].
    pub fn get_client(&self) -> ConnectionClient {
        ConnectionClient { conn: self.clone() }
    }

    /// The server of the current transport, once connected.
    pub fn get_server(&self) -> Option<Server> {
        self.lock().server.clone()
    }

    /// Ends a pending initial reconnect wait now.
    pub fn fast_forward_initial_backoff_timer(&self) {
        self.inner.timer.fire_now();
    }

    /// Cancels any reconnect attempt and closes the transport. Later calls
    /// fail with [`RpcError::Shutdown`]. Safe to call more than once.
    pub async fn shutdown(&self) {
        let cancel = {
            let mut shared = self.lock();
            if shared.shut_down {
                return;
            }
            shared.shut_down = true;
            shared.client = None;
            shared.server = None;
            shared.reconnect.as_ref().map(|a| a.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.inner.timer.fire_now();
        self.inner.transport.close().await;
        info!(handler = self.handler_name(), "connection shut down");
    }
}

/// [`GenericClient`] over a [`Connection`]; each call is a command named
/// after its method.
#[derive(Debug, Clone)]
pub struct ConnectionClient {
    conn: Connection,
}

impl ConnectionClient {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl GenericClient for ConnectionClient {
    async fn call_value(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        compression: CompressionType,
    ) -> Result<Value> {
        let arg = &arg;
        self.conn
            .do_command(ctx, method, move |client| async move {
                client.call_value(ctx, method, arg.clone(), compression).await
            })
            .await
    }

    async fn notify_value(&self, ctx: &Context, method: &str, arg: Value) -> Result<()> {
        let arg = &arg;
        self.conn
            .do_command(ctx, method, move |client| async move {
                client.notify_value(ctx, method, arg.clone()).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{backoff_factory, ZeroBackoff};
    use crate::client::GenericClientExt;
    use crate::protocol::HandlerDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct PipeTransport {
        dials: AtomicUsize,
        active: Mutex<Option<Transport>>,
        staged: Mutex<Option<Transport>>,
        peers: Mutex<Vec<Transport>>,
    }

    impl PipeTransport {
        fn active(&self) -> Option<Transport> {
            self.active.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionTransport for PipeTransport {
        async fn dial(&self, _ctx: &Context) -> Result<Transport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(64 * 1024);
            let peer = Transport::new(far, TransportConfig::default());
            let server = Server::new(&peer, None);
            server.register(Protocol::new("test").with_method(
                "add",
                HandlerDescription::call(|_ctx, (a, b): (i64, i64)| async move { Ok(a + b) }),
            ))?;
            self.peers.lock().unwrap().push(peer);
            let transport = Transport::new(near, TransportConfig::default());
            *self.staged.lock().unwrap() = Some(transport.clone());
            Ok(transport)
        }

        fn is_connected(&self) -> bool {
            self.active
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(Transport::is_connected)
        }

        fn finalize(&self) {
            let staged = self.staged.lock().unwrap().take();
            *self.active.lock().unwrap() = staged;
        }

        async fn close(&self) {
            let active = self.active.lock().unwrap().take();
            if let Some(t) = active {
                t.close().await;
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        connects: AtomicUsize,
        disconnects: Mutex<Vec<DisconnectStatus>>,
    }

    #[async_trait]
    impl ConnectionHandler for CountingHandler {
        async fn on_connect(
            &self,
            _ctx: &Context,
            _conn: &Connection,
            _client: &Client,
            _server: &Server,
        ) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_connect_error(&self, _err: &RpcError, _wait: Duration) {}

        fn on_do_command_error(&self, _err: &RpcError, _wait: Duration) {}

        fn on_disconnected(&self, _ctx: &Context, status: DisconnectStatus) {
            self.disconnects.lock().unwrap().push(status);
        }

        fn should_retry(&self, _name: &str, _err: &RpcError) -> bool {
            false
        }

        fn should_retry_on_connect(&self, _err: &RpcError) -> bool {
            true
        }

        fn handler_name(&self) -> &str {
            "counting"
        }
    }

    fn lazy_opts() -> ConnectionOpts {
        ConnectionOpts {
            dont_connect_now: true,
            reconnect_backoff: Some(backoff_factory(ZeroBackoff)),
            command_backoff: Some(backoff_factory(ZeroBackoff)),
            ..ConnectionOpts::default()
        }
    }

    #[tokio::test]
    async fn test_do_command_connects_lazily() {
        let transport = Arc::new(PipeTransport::default());
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(handler.clone(), transport.clone(), None, lazy_opts());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(transport.dials.load(Ordering::SeqCst), 0);

        let ctx = Context::background();
        let sum: i64 = conn.get_client().call(&ctx, "test.add", &(2, 3)).await.unwrap();
        assert_eq!(sum, 5);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.get_server().is_some());
        assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handler.disconnects.lock().unwrap(),
            vec![DisconnectStatus::StartingFirstConnection]
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_dies() {
        let transport = Arc::new(PipeTransport::default());
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(handler.clone(), transport.clone(), None, lazy_opts());
        let ctx = Context::background();
        conn.wait_for_connection(&ctx).await.unwrap();

        transport.active().unwrap().close().await;
        assert!(!conn.is_connected());

        let sum: i64 = conn.get_client().call(&ctx, "test.add", &(1, 1)).await.unwrap();
        assert_eq!(sum, 2);
        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
        assert_eq!(
            *handler.disconnects.lock().unwrap(),
            vec![
                DisconnectStatus::StartingFirstConnection,
                DisconnectStatus::StartingNonFirstConnection
            ]
        );
    }

    #[tokio::test]
    async fn test_force_reconnect_dials_again() {
        let transport = Arc::new(PipeTransport::default());
        let conn = Connection::new(
            Arc::new(CountingHandler::default()),
            transport.clone(),
            None,
            lazy_opts(),
        );
        let ctx = Context::background();
        conn.wait_for_connection(&ctx).await.unwrap();
        conn.force_reconnect(&ctx).await.unwrap();
        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal_and_idempotent() {
        let transport = Arc::new(PipeTransport::default());
        let conn = Connection::new(
            Arc::new(CountingHandler::default()),
            transport.clone(),
            None,
            lazy_opts(),
        );
        let ctx = Context::background();
        conn.wait_for_connection(&ctx).await.unwrap();
        conn.shutdown().await;
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::ShutDown);
        assert!(transport.active().is_none());
        let err = conn
            .do_command(&ctx, "noop", |_client| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_fire_now_skips_initial_backoff_window() {
        let transport = Arc::new(PipeTransport::default());
        let opts = ConnectionOpts {
            force_initial_backoff: true,
            initial_reconnect_backoff_window: Some(Arc::new(|| Duration::from_secs(3600))),
            ..lazy_opts()
        };
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(handler.clone(), transport, None, opts);
        let ctx = Context::background().with_fire_now();
        let sum: i64 = tokio::time::timeout(
            Duration::from_secs(5),
            conn.get_client().call(&ctx, "test.add", &(4, 4)),
        )
        .await
        .expect("fire-now should skip the wait")
        .unwrap();
        assert_eq!(sum, 8);
        assert_eq!(
            *handler.disconnects.lock().unwrap(),
            vec![DisconnectStatus::StartingNonFirstConnection]
        );
    }

    #[tokio::test]
    async fn test_fast_forward_initial_backoff_timer() {
        let transport = Arc::new(PipeTransport::default());
        let opts = ConnectionOpts {
            force_initial_backoff: true,
            initial_reconnect_backoff_window: Some(Arc::new(|| Duration::from_secs(3600))),
            ..lazy_opts()
        };
        let conn = Connection::new(Arc::new(CountingHandler::default()), transport, None, opts);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_for_connection(&Context::background()).await })
        };
        while conn.state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        conn.fast_forward_initial_backoff_timer();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(conn.is_connected());
    }

    #[test]
    fn test_check_for_retry_only_on_eof() {
        assert!(check_for_retry(&RpcError::Eof));
        assert!(!check_for_retry(&RpcError::Canceled));
        assert!(!check_for_retry(&RpcError::Remote("boom".into())));
    }
}
