//! Common utilities for integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use russh::keys::ssh_key::certificate::{Builder, CertType};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{Certificate, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::server::{Auth, Msg as ServerMsg, Session};
use russh::{client, server, Channel, ChannelId, ChannelMsg, CryptoVec};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// Send `data` to `port` and read the same number of bytes back
pub async fn echo_roundtrip(port: u16, data: &[u8], timeout_secs: u64) -> Result<Vec<u8>, String> {
    let mut stream = timeout(
        Duration::from_secs(timeout_secs),
        TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await
    .map_err(|_| "Connection timeout".to_string())?
    .map_err(|e| format!("Failed to connect: {}", e))?;

    stream
        .write_all(data)
        .await
        .map_err(|e| format!("Failed to write: {}", e))?;

    let mut response = vec![0u8; data.len()];
    timeout(Duration::from_secs(timeout_secs), stream.read_exact(&mut response))
        .await
        .map_err(|_| "Read timeout".to_string())?
        .map_err(|e| format!("Failed to read: {}", e))?;

    Ok(response)
}

/// Wait until `port` refuses connections
pub async fn wait_for_port_closed(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn ed25519() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("Failed to generate key")
}

/// Issue a user certificate for `subject` signed by `ca`
pub fn sign_user_cert(ca: &PrivateKey, subject: &PrivateKey) -> Certificate {
    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        subject.public_key().key_data().clone(),
        0,
        // 证书时间戳按 i64 解码
        i64::MAX as u64,
    )
    .expect("Failed to create certificate builder");
    builder.serial(7).unwrap();
    builder.key_id("integration").unwrap();
    builder.cert_type(CertType::User).unwrap();
    builder.valid_principal("operator").unwrap();
    builder.sign(ca).expect("Failed to sign certificate")
}

/// Key material for one router, written to a private temp directory
pub struct TestKeys {
    pub dir: PathBuf,
    pub ca: PrivateKey,
    pub router: PrivateKey,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub anchor_path: PathBuf,
}

impl TestKeys {
    pub fn generate() -> Self {
        let dir = std::env::temp_dir().join(format!("router-tunnel-it-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("Failed to create temp dir");

        let ca = ed25519();
        let router = ed25519();
        let cert = sign_user_cert(&ca, &router);

        let key_path = dir.join("router_key");
        let cert_path = dir.join("router_key-cert.pub");
        let anchor_path = dir.join("ca.pub");
        std::fs::write(&key_path, router.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        std::fs::write(&cert_path, cert.to_openssh().unwrap()).unwrap();
        std::fs::write(&anchor_path, ca.public_key().to_openssh().unwrap()).unwrap();

        Self {
            dir,
            ca,
            router,
            key_path,
            cert_path,
            anchor_path,
        }
    }

    pub fn anchor(&self) -> PublicKey {
        self.ca.public_key().clone()
    }
}

impl Drop for TestKeys {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// SSH client used to drive the diagnostic endpoint
pub struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub async fn ssh_connect(port: u16) -> client::Handle<TestClient> {
    let config = Arc::new(client::Config::default());
    timeout(
        Duration::from_secs(5),
        client::connect(config, format!("127.0.0.1:{}", port), TestClient),
    )
    .await
    .expect("SSH connect timeout")
    .expect("SSH connect failed")
}

pub async fn auth_with_key(handle: &mut client::Handle<TestClient>, user: &str, key: &PrivateKey) -> bool {
    handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None))
        .await
        .expect("publickey auth errored")
        .success()
}

pub async fn auth_with_cert(
    handle: &mut client::Handle<TestClient>,
    user: &str,
    key: &PrivateKey,
    cert: Certificate,
) -> bool {
    handle
        .authenticate_openssh_cert(user, Arc::new(key.clone()), cert)
        .await
        .expect("certificate auth errored")
        .success()
}

/// Everything the server sent on one channel until it closed
#[derive(Debug, Default)]
pub struct ChannelOutput {
    pub text: String,
    pub exit_status: Option<u32>,
    pub closed: bool,
}

pub async fn collect_output(channel: &mut Channel<client::Msg>, limit: Duration) -> ChannelOutput {
    let mut output = ChannelOutput::default();
    let mut bytes = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;

    loop {
        let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Some(ChannelMsg::Data { data }) => bytes.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => output.exit_status = Some(exit_status),
            Some(ChannelMsg::Close) | None => {
                output.closed = true;
                break;
            }
            Some(_) => {}
        }
    }

    output.text = String::from_utf8_lossy(&bytes).into_owned();
    output
}

/// Read from the channel until `needle` shows up in the accumulated text
pub async fn read_until(channel: &mut Channel<client::Msg>, needle: &str, limit: Duration) -> String {
    let mut bytes = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;

    while !String::from_utf8_lossy(&bytes).contains(needle) {
        match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => bytes.extend_from_slice(&data),
            Ok(Some(ChannelMsg::Close)) | Ok(None) | Err(_) => break,
            Ok(Some(_)) => {}
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Observable state of the rendezvous server
#[derive(Default)]
struct RendezvousState {
    controls: Mutex<Vec<(server::Handle, ChannelId)>>,
    connections: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Minimal SSH rendezvous host: accepts any key, allocates real TCP
/// listeners for `tcpip-forward` and prints a hostname on the control shell
pub struct Rendezvous {
    pub port: u16,
    pub allocated: mpsc::UnboundedReceiver<u32>,
    state: Arc<RendezvousState>,
    shutdown: CancellationToken,
}

impl Rendezvous {
    pub async fn start(hostname: &str) -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind rendezvous");
        let port = listener.local_addr().unwrap().port();
        let config = Arc::new(server::Config {
            keys: vec![ed25519()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        });
        let (tx, allocated) = mpsc::unbounded_channel();
        let state = Arc::new(RendezvousState::default());
        let shutdown = CancellationToken::new();

        let hostname = hostname.to_string();
        let task_state = state.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(_) => break,
                    },
                };
                task_state.connections.fetch_add(1, Ordering::SeqCst);
                let handler = RendezvousHandler {
                    hostname: hostname.clone(),
                    allocated: tx.clone(),
                    state: task_state.clone(),
                    sessions: Vec::new(),
                    listeners: HashMap::new(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self {
            port,
            allocated,
            state,
            shutdown,
        }
    }

    pub fn target(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Wait for the next port handed out by `tcpip-forward`
    pub async fn next_allocated(&mut self) -> u32 {
        timeout(Duration::from_secs(5), self.allocated.recv())
            .await
            .expect("No remote port allocated in time")
            .expect("Rendezvous stopped")
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Close every control shell from the rendezvous side
    pub async fn close_control_sessions(&self) {
        let controls: Vec<_> = self.state.controls.lock().drain(..).collect();
        for (handle, id) in controls {
            let _ = handle.close(id).await;
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct RendezvousHandler {
    hostname: String,
    allocated: mpsc::UnboundedSender<u32>,
    state: Arc<RendezvousState>,
    sessions: Vec<Channel<ServerMsg>>,
    listeners: HashMap<u32, JoinHandle<()>>,
}

impl server::Handler for RendezvousHandler {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_openssh_certificate(
        &mut self,
        _user: &str,
        _certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<ServerMsg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.sessions.push(channel);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let handle = session.handle();
        self.state.controls.lock().push((handle.clone(), channel));
        let banner = format!("Welcome to rendezvous\r\nHOSTNAME={}\r\n", self.hostname);
        tokio::spawn(async move {
            let _ = handle.data(channel, CryptoVec::from_slice(banner.as_bytes())).await;
        });
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await?;
        let allocated = u32::from(listener.local_addr()?.port());
        *port = allocated;

        let handle = session.handle();
        let address = address.to_string();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, peer)) = listener.accept().await {
                let handle = handle.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    let channel = handle
                        .channel_open_forwarded_tcpip(
                            address,
                            allocated,
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await;
                    if let Ok(channel) = channel {
                        let mut stream = channel.into_stream();
                        let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
                    }
                });
            }
        });
        self.listeners.insert(allocated, task);
        let _ = self.allocated.send(allocated);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self.listeners.remove(&port) {
            task.abort();
        }
        Ok(true)
    }
}

impl Drop for RendezvousHandler {
    fn drop(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Remove a directory tree when dropped
pub struct TestCleanup {
    paths: Vec<PathBuf>,
}

impl TestCleanup {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}
