//! Test harness: in-memory transports, scripted handlers and connection setup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use fmprpc_core::backoff::{backoff_factory, ZeroBackoff};
use fmprpc_core::config::TransportConfig;
use fmprpc_core::connection::{
    Connection, ConnectionHandler, ConnectionOpts, ConnectionTransport, DisconnectStatus,
};
use fmprpc_core::{Client, Context, HandlerDescription, Protocol, Result, RpcError, Server, Transport};
use tokio::io::DuplexStream;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const PIPE_CAPACITY: usize = 256 * 1024;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-friendly subscriber once per process. `RUST_LOG`
/// controls the filter.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Two transports joined by an in-memory pipe.
pub fn transport_pair() -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (
        Transport::new(a, TransportConfig::default()),
        Transport::new(b, TransportConfig::default()),
    )
}

/// Serves `protocols` on `transport`.
pub fn serve(transport: &Transport, protocols: &[Protocol]) -> Server {
    let server = Server::new(transport, None);
    for protocol in protocols {
        server
            .register(protocol.clone())
            .expect("protocol registers once");
    }
    server
}

/// `math.add` sums a pair, `math.fail` always errors, `math.hang` takes
/// any argument, waits for cancellation and reports it on `canceled`.
pub fn math_protocol(canceled: Option<tokio::sync::mpsc::UnboundedSender<()>>) -> Protocol {
    Protocol::new("math")
        .with_method(
            "add",
            HandlerDescription::call(|_ctx, (a, b): (i64, i64)| async move { Ok(a + b) }),
        )
        .with_method(
            "fail",
            HandlerDescription::call(|_ctx, _: ()| async move {
                Err::<(), _>(RpcError::Remote("math failed".to_string()))
            }),
        )
        .with_method(
            "hang",
            HandlerDescription::call(move |ctx: Context, _: rmpv::Value| {
                let canceled = canceled.clone();
                async move {
                    let err = ctx.done().await;
                    if let Some(tx) = canceled {
                        let _ = tx.send(());
                    }
                    Err::<(), _>(err)
                }
            }),
        )
}

/// Dials fresh in-memory pipes, serving the given protocols on the far end.
///
/// The first dial can be primed with a prepared client half, and dials can
/// be scripted to fail.
pub struct PipeConnectionTransport {
    protocols: Vec<Protocol>,
    primed: Mutex<Option<DuplexStream>>,
    failures: Mutex<VecDeque<RpcError>>,
    dials: AtomicUsize,
    active: Mutex<Option<Transport>>,
    staged: Mutex<Option<Transport>>,
    servers: Mutex<Vec<Transport>>,
}

impl PipeConnectionTransport {
    pub fn new(protocols: Vec<Protocol>) -> Self {
        Self {
            protocols,
            primed: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
            active: Mutex::new(None),
            staged: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
        }
    }

    fn primed(protocols: Vec<Protocol>, client_half: DuplexStream) -> Self {
        let t = Self::new(protocols);
        *t.primed.lock().unwrap() = Some(client_half);
        t
    }

    /// The next dial fails with `err`. Calls queue up.
    pub fn fail_next(&self, err: RpcError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> Option<Transport> {
        self.active.lock().unwrap().clone()
    }

    /// Server transports, one per successful dial, oldest first.
    pub fn servers(&self) -> Vec<Transport> {
        self.servers.lock().unwrap().clone()
    }

    /// Closes the far end of the active pipe, as a server crash would.
    pub async fn kill_server(&self) {
        let last = self.servers.lock().unwrap().last().cloned();
        if let Some(server) = last {
            server.close().await;
        }
    }
}

#[async_trait]
impl ConnectionTransport for PipeConnectionTransport {
    async fn dial(&self, _ctx: &Context) -> Result<Transport> {
        let attempt = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            debug!(attempt, error = %err, "scripted dial failure");
            return Err(err);
        }
        debug!(attempt, "pipe dial");
        let primed = self.primed.lock().unwrap().take();
        let near = match primed {
            Some(near) => near,
            None => {
                let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
                let server = Transport::new(far, TransportConfig::default());
                serve(&server, &self.protocols);
                self.servers.lock().unwrap().push(server);
                near
            }
        };
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
        let previous = std::mem::replace(&mut *self.active.lock().unwrap(), staged);
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }
    }

    async fn close(&self) {
        let active = self.active.lock().unwrap().take();
        let staged = self.staged.lock().unwrap().take();
        for t in [active, staged].into_iter().flatten() {
            t.close().await;
        }
    }
}

type RetryPredicate = Box<dyn Fn(&str, &RpcError) -> bool + Send + Sync>;

/// Records every callback. Throttle and connect-retry decisions are
/// scripted.
pub struct ScriptedHandler {
    pub connects: AtomicUsize,
    pub connect_errors: AtomicUsize,
    pub command_errors: AtomicUsize,
    pub disconnects: Mutex<Vec<DisconnectStatus>>,
    should_retry: RetryPredicate,
    retry_on_connect: bool,
    on_connect_failures: Mutex<VecDeque<RpcError>>,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            connect_errors: AtomicUsize::new(0),
            command_errors: AtomicUsize::new(0),
            disconnects: Mutex::new(Vec::new()),
            should_retry: Box::new(|_, _| false),
            retry_on_connect: true,
            on_connect_failures: Mutex::new(VecDeque::new()),
        }
    }
}

impl ScriptedHandler {
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &RpcError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Box::new(f);
        self
    }

    pub fn with_retry_on_connect(mut self, retry: bool) -> Self {
        self.retry_on_connect = retry;
        self
    }

    /// The next `on_connect` fails with `err`.
    pub fn fail_next_connect(&self, err: RpcError) {
        self.on_connect_failures.lock().unwrap().push_back(err);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_errors(&self) -> usize {
        self.connect_errors.load(Ordering::SeqCst)
    }

    pub fn command_errors(&self) -> usize {
        self.command_errors.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> Vec<DisconnectStatus> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionHandler for ScriptedHandler {
    async fn on_connect(
        &self,
        _ctx: &Context,
        _conn: &Connection,
        _client: &Client,
        _server: &Server,
    ) -> Result<()> {
        if let Some(err) = self.on_connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_connect_error(&self, _err: &RpcError, _wait: Duration) {
        self.connect_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_do_command_error(&self, _err: &RpcError, _wait: Duration) {
        self.command_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _ctx: &Context, status: DisconnectStatus) {
        self.disconnects.lock().unwrap().push(status);
    }

    fn should_retry(&self, name: &str, err: &RpcError) -> bool {
        (self.should_retry)(name, err)
    }

    fn should_retry_on_connect(&self, _err: &RpcError) -> bool {
        self.retry_on_connect
    }

    fn handler_name(&self) -> &str {
        "scripted"
    }
}

/// Options with immediate retries and no eager connect.
pub fn test_opts() -> ConnectionOpts {
    ConnectionOpts {
        dont_connect_now: true,
        reconnect_backoff: Some(backoff_factory(ZeroBackoff)),
        command_backoff: Some(backoff_factory(ZeroBackoff)),
        ..ConnectionOpts::default()
    }
}

/// A connection, its dialer, and the server transport its first dial
/// reaches.
pub struct TestConnection {
    pub server: Transport,
    pub conn: Connection,
    pub dialer: Arc<PipeConnectionTransport>,
}

/// Builds a server transport serving `protocols` and a [`Connection`]
/// whose first dial hands out the client half of the same pipe. Later
/// dials get fresh pipes serving the same protocols.
pub fn make_connection_for_test(
    protocols: Vec<Protocol>,
    handler: Arc<dyn ConnectionHandler>,
    opts: ConnectionOpts,
) -> TestConnection {
    init_test_logging();
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let server = Transport::new(far, TransportConfig::default());
    serve(&server, &protocols);
    let dialer = Arc::new(PipeConnectionTransport::primed(protocols, near));
    dialer.servers.lock().unwrap().push(server.clone());
    let conn = Connection::new(handler, dialer.clone(), None, opts);
    TestConnection {
        server,
        conn,
        dialer,
    }
}
