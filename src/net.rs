use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Each TCP read is delivered to sinks as one whole chunk; there is no
/// reassembly above the socket layer.
const READ_BUF_SIZE: usize = 1024;

/// Optional send framing on server endpoints: 0x16 0x16 then the payload
/// length as u16 big-endian.
pub const CONTROL_HEADER_MAGIC: [u8; 2] = [0x16, 0x16];

/// Receives every chunk read from a connection.
pub trait DataSink: Send + Sync {
    fn on_data(&self, data: &[u8]);
}

/// Notified when a connection is established or lost.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection(&self, peer: SocketAddr, connected: bool);
}

#[derive(Debug)]
pub enum TransportError {
    Bind(std::io::Error),
    Connect(std::io::Error),
    NotConnected,
    Send(std::io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Bind(e) => write!(f, "Bind failed: {e}"),
            TransportError::Connect(e) => write!(f, "Connect failed: {e}"),
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::Send(e) => write!(f, "Send failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub(crate) fn control_frame(data: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&CONTROL_HEADER_MAGIC);
    framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

// -- Server endpoint --

struct ClientSlot {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

struct ServerShared {
    name: &'static str,
    include_custom_header: bool,
    running: AtomicBool,
    sinks: StdMutex<Vec<Arc<dyn DataSink>>>,
    observers: StdMutex<Vec<Arc<dyn ConnectionObserver>>>,
    clients: Mutex<Vec<ClientSlot>>,
}

impl ServerShared {
    fn notify(&self, peer: SocketAddr, connected: bool) {
        let observers: Vec<_> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_connection(peer, connected);
        }
    }
}

/// Listening TCP endpoint. Every accepted connection gets its own receive
/// loop; `send_data` fans out to all currently connected clients.
pub struct TcpServerEndpoint {
    host: String,
    port: u16,
    shared: Arc<ServerShared>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TcpServerEndpoint {
    pub fn new(name: &'static str, host: &str, port: u16, include_custom_header: bool) -> Self {
        TcpServerEndpoint {
            host: host.to_owned(),
            port,
            shared: Arc::new(ServerShared {
                name,
                include_custom_header,
                running: AtomicBool::new(false),
                sinks: StdMutex::new(Vec::new()),
                observers: StdMutex::new(Vec::new()),
                clients: Mutex::new(Vec::new()),
            }),
            accept_task: StdMutex::new(None),
        }
    }

    pub fn add_data_sink(&self, sink: Arc<dyn DataSink>) {
        self.shared.sinks.lock().unwrap().push(sink);
    }

    pub fn add_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.shared.observers.lock().unwrap().push(observer);
    }

    /// Bind and start accepting. Returns the bound address (useful when
    /// the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(TransportError::Bind)?;
        let addr = listener.local_addr().map_err(TransportError::Bind)?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(shared, listener));
        *self.accept_task.lock().unwrap() = Some(task);

        tracing::info!(endpoint = self.shared.name, %addr, "Server listening");
        Ok(addr)
    }

    /// Send to every connected client. Clients that fail mid-send are
    /// evicted and their observers notified.
    pub async fn send_data(&self, data: &[u8]) {
        let framed;
        let data = if self.shared.include_custom_header {
            framed = control_frame(data);
            &framed[..]
        } else {
            data
        };

        let mut dropped = Vec::new();
        {
            let mut clients = self.shared.clients.lock().await;
            let mut i = 0;
            while i < clients.len() {
                match clients[i].writer.write_all(data).await {
                    Ok(()) => {
                        tracing::debug!(
                            endpoint = self.shared.name,
                            peer = %clients[i].peer,
                            len = data.len(),
                            "Sent"
                        );
                        i += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            endpoint = self.shared.name,
                            peer = %clients[i].peer,
                            "Send failed, dropping client: {e}"
                        );
                        dropped.push(clients.remove(i));
                    }
                }
            }
        }
        for slot in dropped {
            slot.reader.abort();
            self.shared.notify(slot.peer, false);
        }
    }

    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let mut clients = self.shared.clients.lock().await;
        for slot in clients.drain(..) {
            slot.reader.abort();
        }
        tracing::info!(endpoint = self.shared.name, "Server stopped");
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    tracing::error!(endpoint = shared.name, "Accept failed: {e}");
                }
                break;
            }
        };
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        tracing::info!(endpoint = shared.name, %peer, "Client connected");

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(receive_loop(Arc::clone(&shared), read_half, peer));
        shared.clients.lock().await.push(ClientSlot {
            peer,
            writer: write_half,
            reader,
        });
        shared.notify(peer, true);
    }
}

async fn receive_loop(shared: Arc<ServerShared>, mut read_half: OwnedReadHalf, peer: SocketAddr) {
    let sinks: Vec<_> = shared.sinks.lock().unwrap().clone();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(endpoint = shared.name, %peer, "Client disconnected");
                break;
            }
            Ok(n) => {
                tracing::debug!(endpoint = shared.name, %peer, len = n, "Received");
                for sink in &sinks {
                    sink.on_data(&buf[..n]);
                }
            }
            Err(e) => {
                tracing::error!(endpoint = shared.name, %peer, "Receive failed: {e}");
                break;
            }
        }
    }

    // The slot may already be gone if a failed send evicted us.
    let removed = {
        let mut clients = shared.clients.lock().await;
        match clients.iter().position(|slot| slot.peer == peer) {
            Some(i) => {
                clients.remove(i);
                true
            }
            None => false,
        }
    };
    if removed {
        shared.notify(peer, false);
    }
}

// -- Client endpoint --

struct ClientShared {
    running: AtomicBool,
    sink: StdMutex<Option<Arc<dyn DataSink>>>,
    observer: StdMutex<Option<Arc<dyn ConnectionObserver>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    peer: StdMutex<Option<SocketAddr>>,
}

impl ClientShared {
    fn notify(&self, peer: SocketAddr, connected: bool) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_connection(peer, connected);
        }
    }
}

/// Single outbound TCP connection with one receive loop. Loss of the
/// connection, however detected, fires the observer with `false` exactly
/// once; an explicit `disconnect` does not fire it.
pub struct TcpClientEndpoint {
    host: String,
    port: u16,
    shared: Arc<ClientShared>,
}

impl TcpClientEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        TcpClientEndpoint {
            host: host.to_owned(),
            port,
            shared: Arc::new(ClientShared {
                running: AtomicBool::new(false),
                sink: StdMutex::new(None),
                observer: StdMutex::new(None),
                writer: Mutex::new(None),
                reader: StdMutex::new(None),
                peer: StdMutex::new(None),
            }),
        }
    }

    pub fn set_data_sink(&self, sink: Arc<dyn DataSink>) {
        *self.shared.sink.lock().unwrap() = Some(sink);
    }

    pub fn set_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.shared.observer.lock().unwrap() = Some(observer);
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(TransportError::Connect)?;
        let peer = stream.peer_addr().map_err(TransportError::Connect)?;

        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        *self.shared.peer.lock().unwrap() = Some(peer);
        self.shared.running.store(true, Ordering::SeqCst);

        tracing::info!(host = %self.host, port = self.port, "Connected");
        self.shared.notify(peer, true);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(client_receive_loop(shared, read_half, peer));
        *self.shared.reader.lock().unwrap() = Some(task);
        Ok(())
    }

    pub async fn send_data(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let mut writer = self.shared.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        match stream.write_all(data).await {
            Ok(()) => {
                tracing::debug!(host = %self.host, len = data.len(), "Sent");
                Ok(())
            }
            Err(e) => {
                tracing::error!(host = %self.host, "Send failed: {e}");
                let peer = *self.shared.peer.lock().unwrap();
                *writer = None;
                drop(writer);
                if self.shared.running.swap(false, Ordering::SeqCst) {
                    if let Some(task) = self.shared.reader.lock().unwrap().take() {
                        task.abort();
                    }
                    if let Some(peer) = peer {
                        self.shared.notify(peer, false);
                    }
                }
                Err(TransportError::Send(e))
            }
        }
    }

    pub async fn disconnect(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            if let Some(task) = self.shared.reader.lock().unwrap().take() {
                task.abort();
            }
            self.shared.writer.lock().await.take();
            tracing::info!(host = %self.host, port = self.port, "Disconnected");
        }
    }
}

async fn client_receive_loop(
    shared: Arc<ClientShared>,
    mut read_half: OwnedReadHalf,
    peer: SocketAddr,
) {
    let sink = shared.sink.lock().unwrap().clone();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(%peer, "Server closed connection");
                break;
            }
            Ok(n) => {
                tracing::debug!(%peer, len = n, "Received");
                if let Some(sink) = &sink {
                    sink.on_data(&buf[..n]);
                }
            }
            Err(e) => {
                tracing::error!(%peer, "Receive failed: {e}");
                break;
            }
        }
    }

    if shared.running.swap(false, Ordering::SeqCst) {
        shared.writer.lock().await.take();
        shared.notify(peer, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Collector(StdMutex<Vec<Vec<u8>>>);

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Collector(StdMutex::new(Vec::new())))
        }

        fn chunks(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }
    }

    impl DataSink for Collector {
        fn on_data(&self, data: &[u8]) {
            self.0.lock().unwrap().push(data.to_vec());
        }
    }

    struct ConnLog(StdMutex<Vec<bool>>);

    impl ConnLog {
        fn new() -> Arc<Self> {
            Arc::new(ConnLog(StdMutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<bool> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ConnectionObserver for ConnLog {
        fn on_connection(&self, _peer: SocketAddr, connected: bool) {
            self.0.lock().unwrap().push(connected);
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met within 5s");
    }

    #[test]
    fn control_frame_layout() {
        let framed = control_frame(b"abc");
        assert_eq!(framed, vec![0x16, 0x16, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn server_and_client_exchange_data() {
        let server = TcpServerEndpoint::new("test-server", "127.0.0.1", 0, false);
        let server_sink = Collector::new();
        let server_conns = ConnLog::new();
        server.add_data_sink(server_sink.clone());
        server.add_connection_observer(server_conns.clone());
        let addr = server.start().await.unwrap();

        let client = TcpClientEndpoint::new("127.0.0.1", addr.port());
        let client_sink = Collector::new();
        client.set_data_sink(client_sink.clone());
        client.connect().await.unwrap();

        wait_until(|| server_conns.events() == vec![true]).await;

        client.send_data(b"from-client").await.unwrap();
        wait_until(|| server_sink.chunks() == vec![b"from-client".to_vec()]).await;

        server.send_data(b"from-server").await;
        wait_until(|| client_sink.chunks() == vec![b"from-server".to_vec()]).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn custom_header_prefixes_server_sends() {
        let server = TcpServerEndpoint::new("test-framed", "127.0.0.1", 0, true);
        let conns = ConnLog::new();
        server.add_connection_observer(conns.clone());
        let addr = server.start().await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        wait_until(|| conns.events() == vec![true]).await;

        server.send_data(b"hello").await;

        let mut framed = [0u8; 9];
        raw.read_exact(&mut framed).await.unwrap();
        assert_eq!(&framed[..2], &CONTROL_HEADER_MAGIC);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 5);
        assert_eq!(&framed[4..], b"hello");

        server.stop().await;
    }

    #[tokio::test]
    async fn client_loss_fires_observer_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TcpClientEndpoint::new("127.0.0.1", addr.port());
        let conns = ConnLog::new();
        client.set_connection_observer(conns.clone());
        client.connect().await.unwrap();

        // Closing the server side ends the client's receive loop.
        drop(accepted.await.unwrap());

        wait_until(|| conns.events() == vec![true, false]).await;
        assert!(matches!(
            client.send_data(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn server_notices_client_disconnect() {
        let server = TcpServerEndpoint::new("test-disc", "127.0.0.1", 0, false);
        let conns = ConnLog::new();
        server.add_connection_observer(conns.clone());
        let addr = server.start().await.unwrap();

        let raw = TcpStream::connect(addr).await.unwrap();
        wait_until(|| conns.events() == vec![true]).await;

        drop(raw);
        wait_until(|| conns.events() == vec![true, false]).await;

        server.stop().await;
    }
}
