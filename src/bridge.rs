use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Config, ConfigError};
use crate::net::{
    ConnectionObserver, DataSink, TcpClientEndpoint, TcpServerEndpoint, TransportError,
};
use crate::packet::{self, PushPacket, ACK_FRAME_PREFIX, DEFAULT_PRODUCT_ID, TYPE_PUSH};

/// Initial sequence number before the first cloud frame is observed.
pub const SEQ_NR_SEED: u64 = 0x5A61111111111111;

const PUSH_KEY_FILE: &str = "pushkey.txt";
const PRODUCT_ID_FILE: &str = "product_id.txt";
const REQUEST_LOG_FILE: &str = "server_requests.txt";

/// Which side of the proxy produced an observer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Robot,
    Server,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Robot => "robot",
            Origin::Server => "server",
        }
    }
}

/// Everything the bridge reacts to. All three legs and the HTTP hooks
/// funnel into one queue, so bridge state never needs a lock.
#[derive(Debug)]
pub enum BridgeEvent {
    RobotData(Vec<u8>),
    RobotConn(bool),
    CloudData(Vec<u8>),
    CloudConn(bool),
    LocalData(Vec<u8>),
    LocalConn(bool),
    HookUpdate { origin: Origin, data: serde_json::Value },
    SetRemoteServer { host: String, port: u16 },
    SetPushKey(String),
    SetProductId(u32),
    SetSn(String),
    SetSessionId(String),
}

/// Cloneable front door to the bridge actor. This is the surface the HTTP
/// interception hooks (and any other embedder) talk to.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeHandle {
    fn send(&self, event: BridgeEvent) {
        if self.tx.send(event).is_err() {
            tracing::error!("Bridge event loop is gone, dropping event");
        }
    }

    pub fn set_remote_server(&self, host: &str, port: u16) {
        self.send(BridgeEvent::SetRemoteServer {
            host: host.to_owned(),
            port,
        });
    }

    pub fn set_push_key(&self, push_key: &str) {
        self.send(BridgeEvent::SetPushKey(push_key.to_owned()));
    }

    pub fn set_product_id(&self, product_id: u32) {
        self.send(BridgeEvent::SetProductId(product_id));
    }

    pub fn set_sn(&self, sn: &str) {
        self.send(BridgeEvent::SetSn(sn.to_owned()));
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.send(BridgeEvent::SetSessionId(session_id.to_owned()));
    }

    /// Push an incremental state update to local-control observers.
    pub fn push_update(&self, origin: Origin, data: serde_json::Value) {
        self.send(BridgeEvent::HookUpdate { origin, data });
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (BridgeHandle, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BridgeHandle { tx }, rx)
    }
}

// Adapters translating endpoint callbacks into bridge events.

struct EventDataSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    wrap: fn(Vec<u8>) -> BridgeEvent,
}

impl DataSink for EventDataSink {
    fn on_data(&self, data: &[u8]) {
        let _ = self.tx.send((self.wrap)(data.to_vec()));
    }
}

struct EventConnObserver {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    wrap: fn(bool) -> BridgeEvent,
}

impl ConnectionObserver for EventConnObserver {
    fn on_connection(&self, _peer: SocketAddr, connected: bool) {
        let _ = self.tx.send((self.wrap)(connected));
    }
}

fn data_sink(
    tx: &mpsc::UnboundedSender<BridgeEvent>,
    wrap: fn(Vec<u8>) -> BridgeEvent,
) -> Arc<EventDataSink> {
    Arc::new(EventDataSink {
        tx: tx.clone(),
        wrap,
    })
}

fn conn_observer(
    tx: &mpsc::UnboundedSender<BridgeEvent>,
    wrap: fn(bool) -> BridgeEvent,
) -> Arc<EventConnObserver> {
    Arc::new(EventConnObserver {
        tx: tx.clone(),
        wrap,
    })
}

/// A running bridge: the actor task plus the bound leg addresses.
pub struct Bridge {
    handle: BridgeHandle,
    robot_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl Bridge {
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    pub fn robot_addr(&self) -> SocketAddr {
        self.robot_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind the robot and local-control legs and spawn the bridge actor. The
/// cloud leg is created lazily once a remote address is learned.
pub async fn start(config: &Config) -> Result<Bridge, TransportError> {
    let (tx, rx) = mpsc::unbounded_channel();

    let robot_server = TcpServerEndpoint::new("robot", &config.bind_ip, config.robot_port, false);
    robot_server.add_data_sink(data_sink(&tx, BridgeEvent::RobotData));
    robot_server.add_connection_observer(conn_observer(&tx, BridgeEvent::RobotConn));
    let robot_addr = robot_server.start().await?;
    tracing::info!(port = robot_addr.port(), "Robot server started");

    let local_server = TcpServerEndpoint::new(
        "local-control",
        &config.local_control_host,
        config.local_control_port,
        true,
    );
    local_server.add_data_sink(data_sink(&tx, BridgeEvent::LocalData));
    local_server.add_connection_observer(conn_observer(&tx, BridgeEvent::LocalConn));
    let local_addr = local_server.start().await?;
    tracing::info!(port = local_addr.port(), "Local control server started");

    let actor = BridgeActor {
        tx: tx.clone(),
        robot_server,
        local_server,
        cloud: None,
        state_dir: config.state_dir.clone(),
        remote: None,
        last_seq_nr: SEQ_NR_SEED,
        data_cache: serde_json::Map::new(),
        sn: None,
        push_key: load_push_key(&config.state_dir),
        session_id: None,
        robot_connected: false,
        cloud_connected: false,
        local_ack_nr: Vec::new(),
        product_id: load_product_id(&config.state_dir),
    };
    tokio::spawn(actor.run(rx));

    tracing::info!("------------------------------------------------");
    tracing::info!("Proxy ready! Waiting for connection from robot...");
    tracing::info!("------------------------------------------------");

    Ok(Bridge {
        handle: BridgeHandle { tx },
        robot_addr,
        local_addr,
    })
}

struct BridgeActor {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    robot_server: TcpServerEndpoint,
    local_server: TcpServerEndpoint,
    cloud: Option<TcpClientEndpoint>,
    state_dir: PathBuf,
    remote: Option<(String, u16)>,
    last_seq_nr: u64,
    data_cache: serde_json::Map<String, serde_json::Value>,
    sn: Option<String>,
    push_key: Option<String>,
    #[allow(dead_code)]
    session_id: Option<String>,
    robot_connected: bool,
    cloud_connected: bool,
    /// Ack numbers of frames we injected ourselves, in send order. The
    /// robot's matching ack must not reach the cloud.
    local_ack_nr: Vec<u32>,
    product_id: Option<u32>,
}

impl BridgeActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BridgeEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        tracing::info!("Bridge event loop ended");
    }

    async fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::RobotData(buf) => self.on_robot_data(buf).await,
            BridgeEvent::RobotConn(connected) => self.on_robot_conn(connected).await,
            BridgeEvent::CloudData(buf) => self.on_cloud_data(buf).await,
            BridgeEvent::CloudConn(connected) => self.on_cloud_conn(connected).await,
            BridgeEvent::LocalData(buf) => self.on_local_data(buf).await,
            BridgeEvent::LocalConn(connected) => self.on_local_conn(connected).await,
            BridgeEvent::HookUpdate { origin, data } => self.push_update(origin, data).await,
            BridgeEvent::SetRemoteServer { host, port } => self.set_remote_server(host, port).await,
            BridgeEvent::SetPushKey(key) => self.set_push_key(key),
            BridgeEvent::SetProductId(id) => self.set_product_id(id).await,
            BridgeEvent::SetSn(sn) => self.sn = Some(sn),
            BridgeEvent::SetSessionId(sid) => self.session_id = Some(sid),
        }
    }

    // -- Robot leg --

    async fn on_robot_conn(&mut self, connected: bool) {
        self.robot_connected = connected;
        if connected {
            tracing::info!("Robot connected");
            if !self.cloud_connected {
                self.connect_cloud().await;
            }
        } else {
            tracing::warn!("Robot disconnected");
        }
        self.push_snapshot().await;
    }

    async fn on_robot_data(&mut self, buf: Vec<u8>) {
        if self.cloud.is_none() {
            tracing::error!(len = buf.len(), "No cloud connection, cannot forward robot data");
            return;
        }

        if buf.starts_with(&ACK_FRAME_PREFIX) {
            if let Ok(ack_nr) = packet::decode_ack_frame(&buf) {
                if let Some(i) = self.local_ack_nr.iter().position(|&a| a == ack_nr) {
                    self.local_ack_nr.remove(i);
                    tracing::debug!(ack_nr, "Swallowed ack for injected frame");
                    return;
                }
            }
        }

        if let Some(cloud) = &self.cloud {
            match cloud.send_data(&buf).await {
                Ok(()) => tracing::debug!(len = buf.len(), "Forwarded robot data to cloud"),
                Err(e) => tracing::error!("Failed to forward robot data to cloud: {e}"),
            }
        }
    }

    // -- Cloud leg --

    async fn on_cloud_conn(&mut self, connected: bool) {
        self.cloud_connected = connected;
        if connected {
            tracing::info!("Connected to remote server");
        } else {
            tracing::warn!("Disconnected from remote server");
        }
        self.push_snapshot().await;
    }

    async fn on_cloud_data(&mut self, buf: Vec<u8>) {
        // Tee first: the robot's copy must never wait on, or be altered
        // by, the decode branch below.
        self.robot_server.send_data(&buf).await;

        match packet::parse(&buf, self.push_key.as_deref()) {
            Ok(p) if p.packet_type == TYPE_PUSH => {
                tracing::info!(len = buf.len(), "Forwarded server message to robot");
                self.last_seq_nr = p.seq_nr;
                let Some(data) = decoded_payload_object(&p) else {
                    return;
                };
                self.append_request_log(&data);
                self.push_update(Origin::Server, data).await;
                tracing::info!("Forwarded decrypted server payload to local control");
            }
            Ok(p) => {
                tracing::debug!(packet_type = p.packet_type, "Forwarded opaque frame to robot");
            }
            Err(e) => tracing::error!("Error handling server message: {e}"),
        }
    }

    async fn set_remote_server(&mut self, host: String, port: u16) {
        if let Some((old_host, old_port)) = &self.remote {
            tracing::warn!(host = %old_host, port = *old_port, "Replacing existing remote server");
        }
        self.remote = Some((host, port));
        self.connect_cloud().await;
    }

    async fn connect_cloud(&mut self) {
        let Some((host, port)) = self.remote.clone() else {
            tracing::error!("No remote server known yet, cannot connect cloud leg");
            return;
        };

        if let Some(old) = self.cloud.take() {
            old.disconnect().await;
        }

        tracing::info!(%host, port, "Connecting to remote server");
        let client = TcpClientEndpoint::new(&host, port);
        client.set_data_sink(data_sink(&self.tx, BridgeEvent::CloudData));
        client.set_connection_observer(conn_observer(&self.tx, BridgeEvent::CloudConn));
        if let Err(e) = client.connect().await {
            tracing::error!(%host, port, "Failed to connect to remote server: {e}");
        }
        self.cloud = Some(client);
    }

    // -- Local control leg --

    async fn on_local_conn(&mut self, connected: bool) {
        tracing::info!(
            "Local control is {}",
            if connected { "connected" } else { "disconnected" }
        );
        if connected {
            self.push_snapshot().await;
        }
    }

    async fn on_local_data(&mut self, buf: Vec<u8>) {
        let text = match String::from_utf8(buf) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Local control message is not UTF-8: {e}");
                return;
            }
        };
        // Operator writes are unframed; adjacent JSON objects in a single
        // read are split on the }{ boundary.
        for message in split_adjacent_json(&text) {
            self.inject(&message).await;
        }
    }

    async fn inject(&mut self, message: &str) {
        let user: serde_json::Value = match serde_json::from_str(message) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(raw = message, "Error handling local control message: {e}");
                return;
            }
        };

        let (envelope, encrypt) = injection_envelope(&user, self.sn.as_deref());
        let built = match packet::build(
            &envelope,
            self.push_key.as_deref(),
            self.last_seq_nr,
            encrypt,
            self.product_id.unwrap_or(DEFAULT_PRODUCT_ID),
        ) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!("Error building packet for local control message: {e}");
                return;
            }
        };

        tracing::debug!(
            seq_nr = built.seq_nr,
            ack_nr = built.ack_nr,
            "Built packet for local control message"
        );
        self.local_ack_nr.push(built.ack_nr);

        self.robot_server.send_data(&built.bytes).await;
        tracing::debug!("Forwarded local control message to robot");
    }

    // -- Observer updates --

    async fn push_update(&mut self, origin: Origin, data: serde_json::Value) {
        if let Some(update) = data.as_object() {
            for (key, value) in update {
                self.data_cache.insert(key.clone(), value.clone());
            }
        }
        let message = self.observer_message(origin, Some(data));
        self.send_local(&message).await;
    }

    async fn push_snapshot(&mut self) {
        let message = self.observer_message(Origin::Robot, None);
        self.send_local(&message).await;
    }

    fn observer_message(
        &self,
        origin: Origin,
        data: Option<serde_json::Value>,
    ) -> serde_json::Value {
        let cache = data.is_none().then(|| self.data_cache.clone());
        let message = ObserverMessage {
            origin: origin.as_str(),
            sn: self.sn.as_deref(),
            robot_connected: self.robot_connected,
            cloud_connected: self.cloud_connected,
            data,
            cache,
        };
        serde_json::to_value(message).expect("JSON serialization cannot fail for a Value")
    }

    async fn send_local(&self, message: &serde_json::Value) {
        tracing::debug!(%message, "Sending local control update");
        let bytes =
            serde_json::to_vec(message).expect("JSON serialization cannot fail for a Value");
        self.local_server.send_data(&bytes).await;
    }

    // -- Persisted state --

    fn set_push_key(&mut self, push_key: String) {
        match save_state_file(&self.state_dir.join(PUSH_KEY_FILE), &push_key) {
            Ok(()) => tracing::info!("Push key set and saved"),
            Err(e) => tracing::error!("Error saving push key: {e}"),
        }
        self.push_key = Some(push_key);
    }

    async fn set_product_id(&mut self, product_id: u32) {
        self.product_id = Some(product_id);
        match save_state_file(
            &self.state_dir.join(PRODUCT_ID_FILE),
            &product_id.to_string(),
        ) {
            Ok(()) => tracing::info!(product_id, "Product ID set and saved"),
            Err(e) => tracing::error!("Error saving product ID: {e}"),
        }
        self.push_snapshot().await;
    }

    fn append_request_log(&self, data: &serde_json::Value) {
        use std::io::Write;

        let path = self.state_dir.join(REQUEST_LOG_FILE);
        let line = serde_json::to_string(data).expect("JSON serialization cannot fail for a Value");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::error!(path = %path.display(), "Error appending request log: {e}");
        }
    }
}

/// The JSON snapshot pushed to local-control observers. Exactly one of
/// `data` (incremental update) and `cache` (full last-known state) is
/// present.
#[derive(serde::Serialize)]
struct ObserverMessage<'a> {
    origin: &'static str,
    sn: Option<&'a str>,
    robot_connected: bool,
    cloud_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Pull the decoded `data` object out of a parsed push frame. A `data`
/// that is still a string gets one JSON parse attempt; anything that does
/// not end up as an object is not worth pushing to observers.
fn decoded_payload_object(packet: &PushPacket) -> Option<serde_json::Value> {
    let data = packet.payload_json.as_ref()?.get("data")?;
    let value = match data {
        serde_json::Value::String(s) => match serde_json::from_str(s) {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Failed to decode payload data as JSON");
                return None;
            }
        },
        other => other.clone(),
    };
    if value.is_object() {
        Some(value)
    } else {
        tracing::warn!("Cloud payload data is not a JSON object, skipping observer update");
        None
    }
}

/// Wrap an operator message into the on-wire envelope. The user payload is
/// carried as a stringified JSON value, the way the vendor cloud sends it.
fn injection_envelope(user: &serde_json::Value, sn: Option<&str>) -> (serde_json::Value, bool) {
    let info_type = match user.get("infoType") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "30000".to_owned(),
    };
    let encrypt = user
        .get("encrypt")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(1)
        != 0;
    let data = user.get("data").cloned().unwrap_or_else(|| serde_json::json!({}));

    let envelope = serde_json::json!({
        "data": serde_json::to_string(&data).expect("JSON serialization cannot fail for a Value"),
        "extend": {
            "taskid": uuid::Uuid::new_v4().to_string(),
            "usid": "admin",
        },
        "infoType": info_type,
        "sn": sn,
    });
    (envelope, encrypt)
}

fn split_adjacent_json(text: &str) -> Vec<String> {
    let pieces: Vec<&str> = text.split("}{").collect();
    if pieces.len() == 1 {
        return vec![text.to_owned()];
    }
    let last = pieces.len() - 1;
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            let mut message = String::new();
            if i > 0 {
                message.push('{');
            }
            message.push_str(piece);
            if i < last {
                message.push('}');
            }
            message
        })
        .collect()
}

fn load_push_key(dir: &Path) -> Option<String> {
    match std::fs::read_to_string(dir.join(PUSH_KEY_FILE)) {
        Ok(contents) => {
            tracing::info!("Push key loaded from file");
            Some(contents.trim().to_owned())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("No push key file found");
            None
        }
        Err(e) => {
            tracing::error!("Error loading push key: {e}");
            None
        }
    }
}

fn load_product_id(dir: &Path) -> Option<u32> {
    match std::fs::read_to_string(dir.join(PRODUCT_ID_FILE)) {
        Ok(contents) => match contents.trim().parse() {
            Ok(product_id) => {
                tracing::info!(product_id, "Product ID loaded from file");
                Some(product_id)
            }
            Err(e) => {
                tracing::error!("Error parsing product ID file: {e}");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("No product ID file found");
            None
        }
        Err(e) => {
            tracing::error!("Error loading product ID: {e}");
            None
        }
    }
}

fn save_state_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    std::fs::write(path, contents).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const KEY: &str = "0123456789ABCDEF_extra";

    fn temp_state_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "robovac-proxy-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_actor(state_dir: PathBuf) -> BridgeActor {
        let (tx, _rx) = mpsc::unbounded_channel();
        BridgeActor {
            tx,
            robot_server: TcpServerEndpoint::new("robot-test", "127.0.0.1", 0, false),
            local_server: TcpServerEndpoint::new("local-test", "127.0.0.1", 0, true),
            cloud: None,
            state_dir,
            remote: None,
            last_seq_nr: SEQ_NR_SEED,
            data_cache: serde_json::Map::new(),
            sn: Some("SN1".to_owned()),
            push_key: Some(KEY.to_owned()),
            session_id: None,
            robot_connected: false,
            cloud_connected: false,
            local_ack_nr: Vec::new(),
            product_id: None,
        }
    }

    fn ack_frame(ack_nr: u32) -> Vec<u8> {
        let token = format!("ack:{ack_nr}");
        let mut frame = Vec::from(ACK_FRAME_PREFIX);
        frame.extend_from_slice(&(token.len() as u16).to_be_bytes());
        frame.extend_from_slice(token.as_bytes());
        frame
    }

    #[tokio::test]
    async fn injected_ack_is_swallowed_exactly_once() {
        let mut actor = test_actor(temp_state_dir("ack"));
        // Cloud leg present but not connected; forwarding attempts fail
        // with NotConnected, which is enough to observe the decision.
        actor.cloud = Some(TcpClientEndpoint::new("127.0.0.1", 1));
        actor.local_ack_nr = vec![1234, 5678, 1234];

        actor.on_robot_data(ack_frame(1234)).await;
        assert_eq!(actor.local_ack_nr, vec![5678, 1234]);

        actor.on_robot_data(ack_frame(1234)).await;
        assert_eq!(actor.local_ack_nr, vec![5678]);

        // Third time around the number is unknown; the list is untouched
        // and the frame goes to the forwarding path.
        actor.on_robot_data(ack_frame(1234)).await;
        assert_eq!(actor.local_ack_nr, vec![5678]);
    }

    #[tokio::test]
    async fn cloud_frame_advances_last_seq_nr() {
        let mut actor = test_actor(temp_state_dir("seq"));

        let built = packet::build(&json!({"battery": 42}), Some(KEY), 999, true, 60008).unwrap();
        actor.on_cloud_data(built.bytes).await;

        assert_eq!(actor.last_seq_nr, built.seq_nr);
        assert_eq!(actor.data_cache.get("battery"), Some(&json!(42)));

        let log = std::fs::read_to_string(actor.state_dir.join(REQUEST_LOG_FILE)).unwrap();
        assert_eq!(log, "{\"battery\":42}\n");
    }

    #[tokio::test]
    async fn unparseable_cloud_frame_does_not_disturb_state() {
        let mut actor = test_actor(temp_state_dir("garbage"));

        actor.on_cloud_data(b"definitely not a packet".to_vec()).await;
        assert_eq!(actor.last_seq_nr, SEQ_NR_SEED);
        assert!(actor.data_cache.is_empty());
    }

    #[tokio::test]
    async fn update_merges_into_cache_last_writer_wins() {
        let mut actor = test_actor(temp_state_dir("cache"));

        actor
            .push_update(Origin::Server, json!({"battery": 42, "mode": "auto"}))
            .await;
        actor.push_update(Origin::Robot, json!({"battery": 17})).await;

        assert_eq!(actor.data_cache.get("battery"), Some(&json!(17)));
        assert_eq!(actor.data_cache.get("mode"), Some(&json!("auto")));

        let snapshot = actor.observer_message(Origin::Robot, None);
        assert_eq!(snapshot["cache"]["battery"], json!(17));
        assert!(snapshot.get("data").is_none());
    }

    #[test]
    fn injection_envelope_wraps_and_stringifies() {
        let user = json!({"infoType": "30000", "encrypt": 1, "data": {"hello": "world"}});
        let (envelope, encrypt) = injection_envelope(&user, Some("SN1"));

        assert!(encrypt);
        assert_eq!(envelope["infoType"], "30000");
        assert_eq!(envelope["sn"], "SN1");
        assert_eq!(envelope["data"], json!("{\"hello\":\"world\"}"));
        assert_eq!(envelope["extend"]["usid"], "admin");
        let taskid = envelope["extend"]["taskid"].as_str().unwrap();
        uuid::Uuid::parse_str(taskid).unwrap();
    }

    #[test]
    fn injection_envelope_defaults() {
        let (envelope, encrypt) = injection_envelope(&json!({"data": {"a": 1}}), None);
        assert!(encrypt);
        assert_eq!(envelope["infoType"], "30000");
        assert_eq!(envelope["sn"], serde_json::Value::Null);

        let (_, encrypt) = injection_envelope(&json!({"encrypt": 0, "data": {}}), None);
        assert!(!encrypt);
    }

    #[test]
    fn adjacent_json_objects_are_split() {
        assert_eq!(split_adjacent_json(r#"{"a":1}"#), vec![r#"{"a":1}"#]);
        assert_eq!(
            split_adjacent_json(r#"{"a":1}{"b":2}"#),
            vec![r#"{"a":1}"#, r#"{"b":2}"#]
        );
        assert_eq!(
            split_adjacent_json(r#"{"a":1}{"b":2}{"c":3}"#),
            vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]
        );
    }

    #[test]
    fn state_files_roundtrip() {
        let dir = temp_state_dir("files");
        assert!(load_push_key(&dir).is_none());
        assert!(load_product_id(&dir).is_none());

        save_state_file(&dir.join(PUSH_KEY_FILE), "secret-key").unwrap();
        save_state_file(&dir.join(PRODUCT_ID_FILE), "60008").unwrap();

        assert_eq!(load_push_key(&dir).as_deref(), Some("secret-key"));
        assert_eq!(load_product_id(&dir), Some(60008));
    }

    // -- Live three-leg exchange --

    async fn read_control_message(local: &mut TcpStream) -> serde_json::Value {
        let mut header = [0u8; 4];
        timeout(Duration::from_secs(5), local.read_exact(&mut header))
            .await
            .expect("timed out reading control header")
            .unwrap();
        assert_eq!(&header[..2], &[0x16, 0x16]);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;

        let mut body = vec![0u8; len];
        timeout(Duration::from_secs(5), local.read_exact(&mut body))
            .await
            .expect("timed out reading control body")
            .unwrap();
        serde_json::from_slice(&body).unwrap()
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

    #[tokio::test]
    async fn bridge_injects_swallows_and_observes() {
        let state_dir = temp_state_dir("e2e");
        let config = Config {
            bind_ip: "127.0.0.1".to_owned(),
            advertised_ip: "192.168.0.254".to_owned(),
            robot_port: 0,
            local_control_host: "127.0.0.1".to_owned(),
            local_control_port: 0,
            cache_static: false,
            data_path: state_dir.join("data"),
            block_update: true,
            map_intv: 1,
            path_intv: 1,
            status_intv: 1,
            state_dir: state_dir.clone(),
        };
        let bridge = start(&config).await.unwrap();
        let handle = bridge.handle();

        // Stand-in cloud: captures everything the bridge forwards and can
        // push frames back.
        let cloud_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cloud_addr = cloud_listener.local_addr().unwrap();
        let cloud_rx = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
        let cloud_tx =
            Arc::new(tokio::sync::Mutex::new(None::<tokio::net::tcp::OwnedWriteHalf>));
        {
            let cloud_rx = cloud_rx.clone();
            let cloud_tx = cloud_tx.clone();
            tokio::spawn(async move {
                let (stream, _) = cloud_listener.accept().await.unwrap();
                let (mut reader, writer) = stream.into_split();
                *cloud_tx.lock().await = Some(writer);
                let mut buf = [0u8; 1024];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => cloud_rx.lock().unwrap().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }

        handle.set_push_key(KEY);
        handle.set_sn("SN1");
        handle.set_remote_server("127.0.0.1", cloud_addr.port());

        wait_until(|| cloud_tx.try_lock().map(|g| g.is_some()).unwrap_or(false)).await;

        let mut robot = TcpStream::connect(bridge.robot_addr()).await.unwrap();
        let mut local = TcpStream::connect(bridge.local_addr()).await.unwrap();

        // The first local-control message is the cache snapshot sent on attach.
        let snapshot = read_control_message(&mut local).await;
        assert_eq!(snapshot["origin"], "robot");
        assert!(snapshot.get("cache").is_some());

        // Inject an operator command and read the synthesized frame off
        // the robot leg.
        local
            .write_all(br#"{"infoType":"30000","encrypt":1,"data":{"hello":"world"}}"#)
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = timeout(Duration::from_secs(5), robot.read(&mut buf))
            .await
            .expect("timed out reading injected frame")
            .unwrap();
        let injected = packet::parse(&buf[..n], Some(KEY)).unwrap();
        assert_eq!(injected.packet_type, TYPE_PUSH);
        assert_eq!(injected.product_id, 60008);
        assert_eq!(
            injected.seq_nr,
            SEQ_NR_SEED.wrapping_add(u64::from(injected.ack_nr))
        );
        let payload = injected.payload_json.clone().unwrap();
        let data = &payload["data"];
        assert_eq!(data["infoType"], "30000");
        assert_eq!(data["sn"], "SN1");
        assert_eq!(data["extend"]["usid"], "admin");
        uuid::Uuid::parse_str(data["extend"]["taskid"].as_str().unwrap()).unwrap();
        assert_eq!(data["data"], json!("{\"hello\":\"world\"}"));

        // The robot's ack for the injected frame is swallowed; an
        // unrelated frame right after it is the ordering witness.
        let ack = ack_frame(injected.ack_nr);
        robot.write_all(&ack).await.unwrap();
        // Each write must land in its own bridge read, as the real robot's do.
        tokio::time::sleep(Duration::from_millis(100)).await;
        robot.write_all(b"\x00\x05\x00\x01MARK").await.unwrap();
        wait_until(|| {
            let received = cloud_rx.lock().unwrap();
            received.windows(4).any(|w| w == b"MARK")
        })
        .await;
        {
            let received = cloud_rx.lock().unwrap();
            let token = format!("ack:{}", injected.ack_nr);
            assert!(
                !received.windows(token.len()).any(|w| w == token.as_bytes()),
                "injected ack must not reach the cloud"
            );
        }

        // The same ack sent again is no longer tracked and must be forwarded.
        robot.write_all(&ack).await.unwrap();
        wait_until(|| {
            let received = cloud_rx.lock().unwrap();
            let token = format!("ack:{}", injected.ack_nr);
            received.windows(token.len()).any(|w| w == token.as_bytes())
        })
        .await;

        // Cloud pushes a state frame: robot gets the verbatim bytes, the
        // observer gets the decrypted payload.
        let state_frame = packet::build(&json!({"battery": 42}), Some(KEY), 7, true, 60008).unwrap();
        cloud_tx
            .lock()
            .await
            .as_mut()
            .unwrap()
            .write_all(&state_frame.bytes)
            .await
            .unwrap();

        let mut forwarded = vec![0u8; state_frame.bytes.len()];
        timeout(Duration::from_secs(5), robot.read_exact(&mut forwarded))
            .await
            .expect("timed out reading forwarded frame")
            .unwrap();
        assert_eq!(forwarded, state_frame.bytes);

        loop {
            let message = read_control_message(&mut local).await;
            if message["origin"] == "server" {
                assert_eq!(message["data"]["battery"], json!(42));
                break;
            }
        }

        let log = std::fs::read_to_string(state_dir.join(REQUEST_LOG_FILE)).unwrap();
        assert!(log.contains("\"battery\":42"));
    }
}
