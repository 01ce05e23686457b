//! TCP and TLS [`ConnectionTransport`]s.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::client::ErrorUnwrapper;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionHandler, ConnectionOpts, ConnectionTransport};
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::remote::{split_host_port, FmpUri, Remote};
use crate::sigpipe::disable_sigpipe;
use crate::tls;
use crate::transport::Transport;

/// Socket options applied to every dial.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// `None` waits as long as the OS does.
    pub timeout: Option<Duration>,
    pub keepalive: bool,
    pub nodelay: bool,
    pub disable_sigpipe: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            keepalive: true,
            nodelay: true,
            disable_sigpipe: false,
        }
    }
}

impl DialOptions {
    pub fn from_opts(opts: &ConnectionOpts) -> Self {
        Self {
            timeout: opts.dialer_timeout,
            disable_sigpipe: opts.disable_sigpipe,
            ..Self::default()
        }
    }
}

/// Connects to `addr`, trying each resolved address in turn.
pub async fn dial_tcp(addr: &str, opts: &DialOptions) -> Result<TcpStream> {
    let connect = async {
        let mut last_err = None;
        for sock_addr in tokio::net::lookup_host(addr).await? {
            let socket = if sock_addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(opts.keepalive)?;
            match socket.connect(sock_addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err::<TcpStream, io::Error>(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", addr))
        }))
    };

    let stream = match opts.timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", addr, timeout),
            )
        })??,
        None => connect.await?,
    };

    if opts.nodelay {
        stream.set_nodelay(true)?;
    }
    if opts.disable_sigpipe {
        disable_sigpipe(&stream)?;
    }
    Ok(stream)
}

/// Runs `fut` unless `ctx` ends first.
async fn unless_canceled<T>(
    ctx: &Context,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        e = ctx.done() => Err(e),
        r = fut => r,
    }
}

/// The active transport and the one waiting for `finalize`.
#[derive(Default)]
struct Slots {
    active: Option<Transport>,
    staged: Option<Transport>,
}

#[derive(Default)]
struct StagedTransports {
    slots: Mutex<Slots>,
}

impl StagedTransports {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, transport: Transport) {
        let previous = self.lock().staged.replace(transport);
        if let Some(previous) = previous {
            close_in_background(previous);
        }
    }

    fn finalize(&self) {
        let previous = {
            let mut slots = self.lock();
            let staged = slots.staged.take();
            std::mem::replace(&mut slots.active, staged)
        };
        if let Some(previous) = previous {
            close_in_background(previous);
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().active.as_ref().is_some_and(Transport::is_connected)
    }

    async fn close(&self) {
        let (active, staged) = {
            let mut slots = self.lock();
            (slots.active.take(), slots.staged.take())
        };
        for transport in [active, staged].into_iter().flatten() {
            transport.close().await;
        }
    }
}

fn close_in_background(transport: Transport) {
    tokio::spawn(async move { transport.close().await });
}

/// Where a TLS client gets its trust anchors.
#[derive(Clone)]
pub enum TlsRoots {
    /// PEM bundle of root certificates.
    Pem(Vec<u8>),
    /// A fully built client config, used as is.
    Config(Arc<rustls::ClientConfig>),
}

impl std::fmt::Debug for TlsRoots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsRoots::Pem(pem) => write!(f, "TlsRoots::Pem({} bytes)", pem.len()),
            TlsRoots::Config(_) => f.write_str("TlsRoots::Config"),
        }
    }
}

impl TlsRoots {
    fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        match self {
            TlsRoots::Pem(pem) => tls::client_config_from_roots(pem),
            TlsRoots::Config(config) => Ok(config.clone()),
        }
    }
}

/// Dials TLS over TCP to whatever its [`Remote`] hands out.
pub struct TlsConnectionTransport {
    remote: Arc<dyn Remote>,
    roots: TlsRoots,
    dial: DialOptions,
    config: TransportConfig,
    transports: StagedTransports,
}

impl TlsConnectionTransport {
    pub fn new(
        remote: Arc<dyn Remote>,
        roots: TlsRoots,
        dial: DialOptions,
        config: TransportConfig,
    ) -> Self {
        Self {
            remote,
            roots,
            dial,
            config,
            transports: StagedTransports::default(),
        }
    }

    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }
}

#[async_trait]
impl ConnectionTransport for TlsConnectionTransport {
    async fn dial(&self, ctx: &Context) -> Result<Transport> {
        let stream = unless_canceled(ctx, async {
            let addr = self.remote.get_address();
            let (host, _) = split_host_port(&addr)?;
            let config = self.roots.client_config()?;
            debug!(addr = %addr, "dialing");
            let tcp = dial_tcp(&addr, &self.dial).await?;
            debug!(
                addr = %addr,
                local_addr = ?tcp.local_addr().ok(),
                "handshaking"
            );
            let stream = tls::connect(config, host, tcp).await?;
            debug!(addr = %addr, "handshaken");
            Ok::<_, RpcError>(stream)
        })
        .await?;
        let transport = Transport::new(stream, self.config.clone());
        self.transports.stage(transport.clone());
        Ok(transport)
    }

    fn is_connected(&self) -> bool {
        self.transports.is_connected()
    }

    fn finalize(&self) {
        self.transports.finalize();
        self.remote.reset();
    }

    async fn close(&self) {
        self.transports.close().await;
    }
}

/// Plain TCP, for `fmprpc://` URIs and trusted networks.
pub struct TcpConnectionTransport {
    remote: Arc<dyn Remote>,
    dial: DialOptions,
    config: TransportConfig,
    transports: StagedTransports,
}

impl TcpConnectionTransport {
    pub fn new(remote: Arc<dyn Remote>, dial: DialOptions, config: TransportConfig) -> Self {
        Self {
            remote,
            dial,
            config,
            transports: StagedTransports::default(),
        }
    }
}

#[async_trait]
impl ConnectionTransport for TcpConnectionTransport {
    async fn dial(&self, ctx: &Context) -> Result<Transport> {
        let addr = self.remote.get_address();
        debug!(addr = %addr, "dialing");
        let stream = unless_canceled(ctx, dial_tcp(&addr, &self.dial))
            .await
            .map_err(|e| {
                warn!(addr = %addr, error = %e, "dial failed");
                e
            })?;
        let transport = Transport::new(stream, self.config.clone());
        self.transports.stage(transport.clone());
        Ok(transport)
    }

    fn is_connected(&self) -> bool {
        self.transports.is_connected()
    }

    fn finalize(&self) {
        self.transports.finalize();
        self.remote.reset();
    }

    async fn close(&self) {
        self.transports.close().await;
    }
}

impl Connection {
    /// A TLS connection to `remote`, dialing per `opts`.
    pub fn new_tls(
        remote: Arc<dyn Remote>,
        roots: TlsRoots,
        handler: Arc<dyn ConnectionHandler>,
        unwrapper: Option<Arc<dyn ErrorUnwrapper>>,
        opts: ConnectionOpts,
    ) -> Self {
        let transport = TlsConnectionTransport::new(
            remote,
            roots,
            DialOptions::from_opts(&opts),
            opts.transport_config.clone(),
        );
        Self::new(handler, Arc::new(transport), unwrapper, opts)
    }

    /// A connection to `uri`. `fmprpc+tls://` needs `roots`.
    pub fn new_for_uri(
        uri: &FmpUri,
        roots: Option<TlsRoots>,
        handler: Arc<dyn ConnectionHandler>,
        unwrapper: Option<Arc<dyn ErrorUnwrapper>>,
        opts: ConnectionOpts,
    ) -> Result<Self> {
        let remote: Arc<dyn Remote> = Arc::new(uri.remote());
        if uri.use_tls() {
            let roots = roots.ok_or_else(|| RpcError::Tls {
                reason: format!("no root certificates for {}", uri),
            })?;
            return Ok(Self::new_tls(remote, roots, handler, unwrapper, opts));
        }
        let transport = TcpConnectionTransport::new(
            remote,
            DialOptions::from_opts(&opts),
            opts.transport_config.clone(),
        );
        Ok(Self::new(handler, Arc::new(transport), unwrapper, opts))
    }
}
