//! SSH tunnels for connections behind a bastion.
//!
//! A [`Tunnel`] forwards an ephemeral `127.0.0.1` port to the database host
//! over `direct-tcpip` channels of one SSH session. It belongs to a single
//! logical session and is torn down on [`Tunnel::close`] or when dropped.
//!
//! Dialing retries network failures with exponential backoff. Rejected
//! credentials and unusable key material fail immediately.

use crate::config::TunnelConfig;
use crate::error::{SluiceError, SluiceResult};
use crate::models::{Connection, QueryHandle, SecretString, SshMode};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use parking_lot::Mutex;
use russh::client;
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Requested, not yet dialing
    Requested,
    /// Dialing and authenticating
    Dialing,
    /// Forwarding
    Established,
    /// Torn down
    Closed,
    /// Dialing gave up
    Failed,
}

/// How the SSH session authenticates.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(SecretString),
    /// Private key, optionally encrypted with a passphrase
    Key {
        /// OpenSSH/PEM private key material
        key: SecretString,
        /// Passphrase for an encrypted key
        passphrase: Option<SecretString>,
    },
}

/// Everything needed to open one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Connection the tunnel serves
    pub connection_id: Uuid,
    /// SSH server host
    pub ssh_host: String,
    /// SSH server port
    pub ssh_port: u16,
    /// SSH login user
    pub ssh_user: String,
    /// Authentication method
    pub auth: SshAuth,
    /// Database host as seen from the SSH server
    pub remote_host: String,
    /// Database port as seen from the SSH server
    pub remote_port: u16,
}

impl TunnelRequest {
    /// Build the tunnel request of a connection; `None` when SSH is off.
    pub fn for_connection(connection: &Connection) -> SluiceResult<Option<Self>> {
        let auth = match connection.ssh_mode {
            SshMode::None => return Ok(None),
            SshMode::Password => SshAuth::Password(connection.ssh.password.clone()),
            SshMode::Keyfile => SshAuth::Key { key: connection.ssh.key.clone(), passphrase: None },
            SshMode::PasswordAndKeyfile => SshAuth::Key {
                key: connection.ssh.key.clone(),
                passphrase: Some(connection.ssh.password.clone()),
            },
        };
        let (ssh_host, ssh_port) = connection.ssh.address()?;

        Ok(Some(Self {
            connection_id: connection.id,
            ssh_host,
            ssh_port,
            ssh_user: connection.ssh.user.expose().to_string(),
            auth,
            remote_host: connection.host.expose().to_string(),
            remote_port: connection.port_number()?,
        }))
    }
}

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: pin bastion host keys per connection instead of accepting any key.
        Ok(true)
    }
}

type SshSession = client::Handle<SshClientHandler>;

/// Opens tunnels according to the configured dial policy.
#[derive(Debug, Clone)]
pub struct TunnelManager {
    config: TunnelConfig,
}

impl TunnelManager {
    /// Create a manager with the given dial policy.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.retry_min_delay_ms))
            .with_max_delay(Duration::from_millis(self.config.retry_max_delay_ms))
            .with_max_times(self.config.retry_max_times)
            .with_jitter()
    }

    /// Dial, authenticate and start forwarding.
    ///
    /// Cancelling `handle` while dialing aborts with `QueryCancelled`.
    pub async fn open(&self, request: TunnelRequest, handle: &QueryHandle) -> SluiceResult<Tunnel> {
        let connection_id = request.connection_id;
        tracing::debug!(connection_id = %connection_id, state = ?TunnelState::Requested, "Tunnel requested");

        let key = decode_key(&request.auth)?;
        let attempts = AtomicU32::new(0);

        tracing::info!(
            connection_id = %connection_id,
            ssh_host = %request.ssh_host,
            ssh_port = request.ssh_port,
            state = ?TunnelState::Dialing,
            "Establishing SSH tunnel"
        );

        let dial = {
            let request = &request;
            let key = key.as_ref();
            let attempts = &attempts;
            move || async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.dial_once(request, key).await
            }
        };

        let dialed = tokio::select! {
            result = dial
                .retry(self.retry_policy())
                .when(|err: &SluiceError| err.is_tunnel_network())
                .notify(|err, dur: Duration| {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %err,
                        "SSH dial failed, retrying in {:?}",
                        dur
                    );
                }) => result,
            _ = handle.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Tunnel dial cancelled");
                return Err(SluiceError::query_cancelled(handle.id()));
            }
        };

        let session = match dialed {
            Ok(session) => session,
            Err(err) => {
                let err = with_attempts(err, attempts.load(Ordering::Relaxed));
                tracing::warn!(
                    connection_id = %connection_id,
                    state = ?TunnelState::Failed,
                    error = %err,
                    "SSH tunnel failed"
                );
                return Err(err);
            }
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
            SluiceError::connection(format!("Failed to bind local port for SSH tunnel: {e}"))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            SluiceError::connection(format!("Failed to read SSH tunnel local address: {e}"))
        })?;

        let cancel_token = CancellationToken::new();
        let state = Arc::new(Mutex::new(TunnelState::Established));

        tokio::spawn(run_tunnel(
            listener,
            Arc::new(tokio::sync::Mutex::new(session)),
            request.remote_host.clone(),
            request.remote_port,
            connection_id,
            cancel_token.clone(),
            state.clone(),
        ));

        tracing::info!(
            connection_id = %connection_id,
            local_port = local_addr.port(),
            state = ?TunnelState::Established,
            "SSH tunnel established"
        );

        Ok(Tunnel { connection_id, local_addr, cancel_token, state })
    }

    /// One dial + handshake + authentication attempt.
    async fn dial_once(
        &self,
        request: &TunnelRequest,
        key: Option<&Arc<KeyPair>>,
    ) -> SluiceResult<SshSession> {
        let config = Arc::new(client::Config::default());
        let addr = (request.ssh_host.as_str(), request.ssh_port);

        let mut session = tokio::time::timeout(
            self.config.dial_timeout(),
            client::connect(config, addr, SshClientHandler),
        )
        .await
        .map_err(|_| {
            SluiceError::tunnel_network(format!(
                "timed out connecting to SSH server {}:{}",
                request.ssh_host, request.ssh_port
            ))
        })?
        .map_err(|e| {
            SluiceError::tunnel_network(format!(
                "Failed to connect to SSH server {}:{}: {e}",
                request.ssh_host, request.ssh_port
            ))
        })?;

        let authenticated = match (&request.auth, key) {
            (SshAuth::Password(password), _) => {
                session.authenticate_password(request.ssh_user.as_str(), password.expose()).await
            }
            (SshAuth::Key { .. }, Some(key)) => {
                session.authenticate_publickey(request.ssh_user.as_str(), key.clone()).await
            }
            (SshAuth::Key { .. }, None) => {
                return Err(SluiceError::internal("SSH key was not decoded before dialing"))
            }
        }
        .map_err(|e| SluiceError::tunnel_network(format!("SSH authentication exchange failed: {e}")))?;

        if !authenticated {
            return Err(SluiceError::tunnel_auth(format!(
                "SSH server rejected credentials for user '{}'",
                request.ssh_user
            )));
        }

        tracing::debug!(
            ssh_host = %request.ssh_host,
            ssh_user = %request.ssh_user,
            "SSH authentication successful"
        );
        Ok(session)
    }
}

/// A live SSH tunnel. Dropping it tears the tunnel down.
pub struct Tunnel {
    connection_id: Uuid,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    state: Arc<Mutex<TunnelState>>,
}

impl Tunnel {
    /// Local endpoint the database driver should connect to.
    pub fn endpoint(&self) -> SluiceResult<SocketAddr> {
        match *self.state.lock() {
            TunnelState::Established => Ok(self.local_addr),
            _ => Err(SluiceError::TunnelClosed),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Connection this tunnel serves.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Tear the tunnel down.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state != TunnelState::Closed {
            *state = TunnelState::Closed;
            self.cancel_token.cancel();
            tracing::info!(
                connection_id = %self.connection_id,
                local_port = self.local_addr.port(),
                "SSH tunnel closed"
            );
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("connection_id", &self.connection_id)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Decode the private key up front so bad key material is never retried.
fn decode_key(auth: &SshAuth) -> SluiceResult<Option<Arc<KeyPair>>> {
    let SshAuth::Key { key, passphrase } = auth else {
        return Ok(None);
    };

    let passphrase = passphrase.as_ref().map(|p| p.expose()).filter(|p| !p.is_empty());
    russh_keys::decode_secret_key(key.expose(), passphrase)
        .map(|pair| Some(Arc::new(pair)))
        .map_err(|e| SluiceError::tunnel_auth(format!("SSH key could not be decoded: {e}")))
}

fn with_attempts(err: SluiceError, attempts: u32) -> SluiceError {
    match err {
        SluiceError::TunnelNetwork { message, .. } => {
            SluiceError::TunnelNetwork { message, attempts: attempts.max(1) }
        }
        other => other,
    }
}

/// Accept loop; runs until cancelled.
async fn run_tunnel(
    listener: TcpListener,
    session: Arc<tokio::sync::Mutex<SshSession>>,
    remote_host: String,
    remote_port: u16,
    connection_id: Uuid,
    cancel_token: CancellationToken,
    state: Arc<Mutex<TunnelState>>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::trace!(connection_id = %connection_id, %peer_addr, "Tunnel client accepted");

                        let session = session.clone();
                        let remote_host = remote_host.clone();
                        let cancel = cancel_token.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                forward_connection(local_stream, session, &remote_host, remote_port, cancel).await
                            {
                                tracing::warn!(connection_id = %connection_id, error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(connection_id = %connection_id, error = %e, "Failed to accept tunnel connection");
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                *state.lock() = TunnelState::Closed;
                tracing::debug!(connection_id = %connection_id, "Tunnel accept loop stopped");
                break;
            }
        }
    }
}

/// Pipe one local client through a `direct-tcpip` channel.
async fn forward_connection(
    mut local_stream: TcpStream,
    session: Arc<tokio::sync::Mutex<SshSession>>,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> SluiceResult<()> {
    let channel = {
        let session = session.lock().await;
        session
            .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SluiceError::tunnel_network(format!("Failed to open SSH channel: {e}"))
            })?
    };

    let mut channel = channel.into_stream();
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut channel) => {
            if let Ok((sent, received)) = copied {
                tracing::trace!(sent, received, "Tunnel client finished");
            }
        }
        _ = cancel_token.cancelled() => {}
    }
    Ok(())
}
