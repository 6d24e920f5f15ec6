//! SSH tunnel supervisor (§4.4): a loopback TCP listener that forwards
//! every inbound connection through an authenticated SSH session to the
//! server's real `(host, port)`, via libssh2 direct-channel forwarding.
//!
//! All SSH/libssh2 operations are confined to a single blocking OS thread
//! (libssh2 sessions aren't safely shared across threads); that thread is
//! spawned through `tokio::task::spawn_blocking` so it never occupies an
//! async reactor worker.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ssh2::Session;
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};
use crate::ssh::types::{SshAuthMethod, SshTunnelConfig};

/// A running tunnel. Dropping it signals the background thread to shut
/// down; in-flight sockets are closed as the loop tears down.
pub struct SshTunnel {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    /// Fires if the tunnel loop terminates on its own (connection lost,
    /// accept error); the Session treats this as a terminal error.
    pub error_rx: Option<oneshot::Receiver<String>>,
    _thread: tokio::task::JoinHandle<()>,
}

impl SshTunnel {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_host(&self) -> &'static str {
        "127.0.0.1"
    }

    /// Establish the SSH session, verify reachability of the destination,
    /// bind a loopback listener, and spawn the forwarding loop.
    pub async fn start(config: SshTunnelConfig) -> Result<Self> {
        let (error_tx, error_rx) = oneshot::channel();

        let (local_port, shutdown, thread) = tokio::task::spawn_blocking(move || {
            start_blocking(config, error_tx)
        })
        .await
        .map_err(|e| GatewayError::Connect(format!("tunnel setup task panicked: {e}")))??;

        Ok(Self {
            local_port,
            shutdown,
            error_rx: Some(error_rx),
            _thread: thread,
        })
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

type StartResult = Result<(u16, Arc<AtomicBool>, tokio::task::JoinHandle<()>)>;

fn start_blocking(config: SshTunnelConfig, error_tx: oneshot::Sender<String>) -> StartResult {
    let session = establish_session(&config)?;

    session.set_blocking(true);
    session
        .channel_direct_tcpip(&config.remote_host, config.remote_port, None)
        .map_err(|e| {
            GatewayError::Connect(format!(
                "tunnel cannot reach {}:{} through ssh server: {e}",
                config.remote_host, config.remote_port
            ))
        })?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| GatewayError::Connect(format!("failed to bind local tunnel port: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| GatewayError::Connect(format!("failed to configure tunnel listener: {e}")))?;
    let local_port = listener
        .local_addr()
        .map_err(|e| GatewayError::Connect(format!("failed to read tunnel local addr: {e}")))?
        .port();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    // The forwarding loop is plain blocking work; run it on a dedicated
    // blocking-pool task rather than the async reactor.
    let handle = tokio::task::spawn_blocking(move || {
        run_tunnel_loop(listener, session, remote_host, remote_port, shutdown_clone, error_tx);
    });

    Ok((local_port, shutdown, handle))
}

fn establish_session(config: &SshTunnelConfig) -> Result<Session> {
    let tcp = TcpStream::connect((config.ssh_host.as_str(), config.ssh_port))
        .map_err(|e| GatewayError::Connect(format!("ssh tcp connect failed: {e}")))?;
    tcp.set_nodelay(true).ok();

    let mut session =
        Session::new().map_err(|e| GatewayError::Connect(format!("ssh session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| GatewayError::Connect(format!("ssh handshake failed: {e}")))?;

    match &config.auth {
        SshAuthMethod::Password(password) => {
            session
                .userauth_password(&config.ssh_user, password)
                .map_err(|e| GatewayError::Connect(format!("ssh password auth failed: {e}")))?;
        }
        SshAuthMethod::PrivateKey {
            private_key_path,
            passphrase,
        } => {
            let path = expand_tilde(Path::new(private_key_path));
            session
                .userauth_pubkey_file(&config.ssh_user, None, &path, passphrase.as_deref())
                .map_err(|e| GatewayError::Connect(format!("ssh key auth failed: {e}")))?;
        }
    }

    if !session.authenticated() {
        return Err(GatewayError::Connect("ssh authentication failed".into()));
    }

    Ok(session)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(home) = dirs::home_dir() {
        if let Some(rest) = s.strip_prefix("~/") {
            return home.join(rest);
        }
        if s == "~" {
            return home;
        }
    }
    path.to_path_buf()
}

struct TunnelConnection {
    client: TcpStream,
    channel: ssh2::Channel,
    client_buf: Vec<u8>,
    channel_buf: Vec<u8>,
    closed: bool,
}

impl TunnelConnection {
    fn new(client: TcpStream, channel: ssh2::Channel) -> std::io::Result<Self> {
        client.set_nodelay(true)?;
        client.set_nonblocking(true)?;
        Ok(Self {
            client,
            channel,
            client_buf: vec![0u8; 8192],
            channel_buf: vec![0u8; 8192],
            closed: false,
        })
    }

    fn poll(&mut self) {
        if self.closed {
            return;
        }
        match self.client.read(&mut self.client_buf) {
            Ok(0) => {
                self.closed = true;
                return;
            }
            Ok(n) => {
                if self.channel.write_all(&self.client_buf[..n]).is_err() {
                    self.closed = true;
                    return;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => {
                self.closed = true;
                return;
            }
        }

        match self.channel.read(&mut self.channel_buf) {
            Ok(0) => self.closed = true,
            Ok(n) => {
                if self.client.write_all(&self.channel_buf[..n]).is_err() {
                    self.closed = true;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.closed = true,
        }
    }
}

/// Single-threaded multiplexing loop: all libssh2 calls stay on this one
/// thread for the lifetime of the tunnel.
fn run_tunnel_loop(
    listener: TcpListener,
    session: Session,
    remote_host: String,
    remote_port: u16,
    shutdown: Arc<AtomicBool>,
    error_tx: oneshot::Sender<String>,
) {
    session.set_blocking(false);
    let mut connections: Vec<TunnelConnection> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((client_stream, _addr)) => {
                session.set_blocking(true);
                let opened = session.channel_direct_tcpip(&remote_host, remote_port, None);
                session.set_blocking(false);
                match opened {
                    Ok(channel) => {
                        if let Ok(conn) = TunnelConnection::new(client_stream, channel) {
                            connections.push(conn);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ssh tunnel failed to open channel for inbound connection");
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                let _ = error_tx.send(format!("tunnel listener error: {e}"));
                break;
            }
        }

        for conn in &mut connections {
            conn.poll();
        }
        connections.retain(|c| !c.closed);

        std::thread::sleep(std::time::Duration::from_micros(500));
    }
}
