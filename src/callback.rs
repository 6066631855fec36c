//! Loopback listener for the authorization-code leg of an OAuth2 login.
//!
//! The listener is bound before the browser is opened, answers every request
//! on the redirect port, and keeps the first `code` query parameter that
//! arrives with the expected `state`. The waiting side polls that slot until
//! it is filled or the deadline passes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<html><head><title>Authentication Successful</title></head>\
<body><h1>Authentication Successful!</h1>\
<p>You can now close this window and return to the application.</p></body></html>";

const FAILURE_PAGE: &str = "<html><head><title>Authentication Failed</title></head>\
<body><h1>Authentication Failed</h1>\
<p>No valid authorization code was received. Please try again.</p></body></html>";

/// Opens the authorization URL for the user.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the system browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

type CodeSlot = Arc<Mutex<Option<String>>>;

/// A bound, not yet serving, callback listener.
pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl CallbackListener {
    pub async fn bind(port: u16) -> SyncResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            SyncError::configuration(format!("cannot listen on callback port {port}: {e}"))
        })?;
        let addr = listener.local_addr()?;
        debug!("callback listener bound on {}", addr);

        Ok(Self {
            listener,
            addr,
            poll_interval: POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[cfg(test)]
    pub fn with_intervals(mut self, poll: Duration, heartbeat: Duration) -> Self {
        self.poll_interval = poll;
        self.heartbeat_interval = heartbeat;
        self
    }

    /// Serves the redirect, opens the browser, and waits for a code whose
    /// `state` matches `expected_state`.
    ///
    /// Returns `None` on timeout. The listener is closed before this returns
    /// on every path.
    pub async fn wait_for_code(
        self,
        auth_url: &str,
        expected_state: &str,
        opener: &dyn UrlOpener,
        timeout: Duration,
    ) -> Option<String> {
        let slot: CodeSlot = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(serve(
            self.listener,
            slot.clone(),
            Arc::from(expected_state),
            shutdown_rx,
        ));

        info!("Opening browser for authorization...");
        if let Err(e) = opener.open(auth_url) {
            warn!("failed to open browser: {}", e);
            info!("Open this URL to authorize: {}", auth_url);
        }

        info!("Waiting for authorization to complete...");
        let code = poll_slot(&slot, timeout, self.poll_interval, self.heartbeat_interval).await;

        shutdown(server, shutdown_tx).await;

        match &code {
            Some(_) => info!("Authorization code received successfully"),
            None => warn!("Timed out waiting for authorization after {}s", timeout.as_secs()),
        }
        code
    }
}

/// Binds `port`, builds the authorization URL for the port actually bound,
/// and waits for the redirect. `Ok(None)` means the wait timed out.
pub async fn run(
    port: u16,
    timeout: Duration,
    opener: &dyn UrlOpener,
    expected_state: &str,
    auth_url: impl FnOnce(u16) -> SyncResult<String>,
) -> SyncResult<Option<String>> {
    let listener = CallbackListener::bind(port).await?;
    let auth_url = auth_url(listener.port())?;
    Ok(listener
        .wait_for_code(&auth_url, expected_state, opener, timeout)
        .await)
}

async fn poll_slot(
    slot: &CodeSlot,
    timeout: Duration,
    poll: Duration,
    heartbeat: Duration,
) -> Option<String> {
    let started = tokio::time::Instant::now();
    let deadline = started + timeout;
    let mut next_heartbeat = started + heartbeat;

    loop {
        if let Some(code) = take_code(slot) {
            return Some(code);
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return None;
        }
        if now >= next_heartbeat {
            info!(
                "Still waiting for authorization... ({} seconds)",
                (now - started).as_secs()
            );
            next_heartbeat += heartbeat;
        }

        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

fn take_code(slot: &CodeSlot) -> Option<String> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

async fn shutdown(server: JoinHandle<()>, shutdown_tx: oneshot::Sender<()>) {
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        warn!("callback listener task ended abnormally: {}", e);
    }
}

async fn serve(
    listener: TcpListener,
    slot: CodeSlot,
    state: Arc<str>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("callback request from {}", peer);
                    let slot = slot.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(REQUEST_TIMEOUT, handle(stream, &slot, &state)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!("callback request failed: {}", e),
                            Err(_) => debug!("callback request from {} timed out", peer),
                        }
                    });
                }
                Err(e) => warn!("failed to accept callback connection: {}", e),
            },
        }
    }
    debug!("callback listener stopped");
}

async fn handle(stream: TcpStream, slot: &CodeSlot, expected_state: &str) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers so the client sees a clean response.
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let code = request_line
        .split_whitespace()
        .nth(1)
        .and_then(|target| extract_code(target, expected_state));

    let (status, page) = match code {
        Some(code) => {
            let mut guard = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.get_or_insert(code);
            ("200 OK", SUCCESS_PAGE)
        }
        None => ("400 Bad Request", FAILURE_PAGE),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Pulls a non-empty `code` parameter out of a request target, provided the
/// request carries the expected `state`.
fn extract_code(target: &str, expected_state: &str) -> Option<String> {
    let url = Url::parse("http://localhost").ok()?.join(target).ok()?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    if param("state").as_deref() != Some(expected_state) {
        debug!("callback request without matching state ignored");
        return None;
    }
    param("code").filter(|code| !code.is_empty())
}

/// The code obtained from the redirect, plus the redirect URI that must be
/// echoed back when exchanging it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub redirect_uri: String,
}

/// Request for one interactive authorization.
pub struct GrantRequest<'a> {
    pub provider: &'a str,
    pub port: u16,
    /// Anti-forgery value the redirect must echo back.
    pub state: &'a str,
    pub redirect_uri: &'a (dyn Fn(u16) -> String + Send + Sync),
    pub authorization_url: &'a (dyn Fn(&str) -> SyncResult<String> + Send + Sync),
}

/// Obtains an authorization code from the user.
#[async_trait]
pub trait CodeGrant: Send + Sync {
    async fn obtain_code(&self, request: GrantRequest<'_>) -> SyncResult<AuthorizationCode>;
}

/// Browser plus loopback listener.
pub struct LoopbackGrant {
    pub timeout: Duration,
    pub opener: Arc<dyn UrlOpener>,
}

impl LoopbackGrant {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            opener: Arc::new(SystemBrowser),
        }
    }
}

#[async_trait]
impl CodeGrant for LoopbackGrant {
    async fn obtain_code(&self, request: GrantRequest<'_>) -> SyncResult<AuthorizationCode> {
        let mut redirect_uri = String::new();
        let code = run(
            request.port,
            self.timeout,
            self.opener.as_ref(),
            request.state,
            |port| {
                redirect_uri = (request.redirect_uri)(port);
                (request.authorization_url)(&redirect_uri)
            },
        )
        .await?;

        match code {
            Some(code) => Ok(AuthorizationCode { code, redirect_uri }),
            None => Err(SyncError::AuthorizationTimeout {
                provider: request.provider.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}
