use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nmxp_rs_protocol::channel::encode_precis_list;
use nmxp_rs_protocol::message::{HEADER_LEN, decode_header, encode_message};
use nmxp_rs_protocol::packet::{PacketHeader, encode_compressed};
use nmxp_rs_protocol::{ChannelDirectory, MessageType, PrecisEntry, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Samples carried by a [`compressed_message`] packet.
pub const PACKET_SAMPLES: usize = 16;

/// Duration of a [`compressed_message`] packet in 1/10000 s.
pub const PACKET_TICKS: u64 = 1600;

/// COMPRESSED message with one bundle of sixteen equal byte diffs at 100 Hz.
///
/// The packet decodes to `x0, x0 + diff, ...` and its rebasing value is
/// `x0 + 16 * diff`.
pub fn compressed_message(
    instrument_id: u16,
    channel: u8,
    sequence: u32,
    ticks: u64,
    x0: i32,
    diff: i8,
) -> Vec<u8> {
    let header = PacketHeader {
        packet_type: 1,
        seconds: (ticks / 10_000) as u32,
        ticks: (ticks % 10_000) as u16,
        instrument_id,
        sequence_number: sequence,
        rate_byte: (9 << 3) | channel,
        x0,
    };
    let mut bundle = [diff as u8; 17];
    bundle[0] = 0x55;
    encode_message(MessageType::Compressed, &encode_compressed(0, &header, &bundle))
}

pub fn error_message(text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    body.push(0);
    encode_message(MessageType::Error, &body)
}

pub fn ready_message() -> Vec<u8> {
    encode_message(MessageType::Ready, &[])
}

/// Requests received by a mock server, one list per accepted connection.
#[derive(Clone, Default)]
pub struct Captured {
    inner: Arc<Mutex<Vec<Vec<Request>>>>,
}

impl Captured {
    fn open(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.push(Vec::new());
        inner.len() - 1
    }

    fn record(&self, conn: usize, request: Request) {
        self.inner.lock().unwrap()[conn].push(request);
    }

    pub fn connections(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn connection(&self, conn: usize) -> Vec<Request> {
        self.inner
            .lock()
            .unwrap()
            .get(conn)
            .cloned()
            .unwrap_or_default()
    }

    /// Poll until `done` holds for connection `conn`, for up to two seconds.
    pub async fn wait_for(&self, conn: usize, done: impl Fn(&[Request]) -> bool) -> Vec<Request> {
        for _ in 0..400 {
            let requests = self.connection(conn);
            if done(&requests) {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.connection(conn)
    }
}

async fn read_request(reader: &mut OwnedReadHalf) -> Option<Request> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.ok()?;
    let header = decode_header(&header).ok()?;
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await.ok()?;
    Request::parse(header.msg_type, &body).ok()
}

async fn write_all(writer: &mut OwnedWriteHalf, messages: &[Vec<u8>], delay: Option<Duration>) -> bool {
    for msg in messages {
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if writer.write_all(msg).await.is_err() {
            return false;
        }
    }
    writer.flush().await.is_ok()
}

pub struct NaqsConfig {
    pub directory: ChannelDirectory,
    /// Messages sent after AddTimeSeriesChannels, one list per connection.
    pub connection_messages: Vec<Vec<Vec<u8>>>,
    /// Pause before each streamed message.
    pub message_delay: Option<Duration>,
    /// Drop the socket once a connection's messages are sent.
    pub close_after_stream: bool,
    /// Reply to CONNECT with this instead of the channel list.
    pub connect_reply: Option<Vec<u8>>,
    pub max_connections: usize,
}

impl NaqsConfig {
    pub fn new(directory: ChannelDirectory, messages: Vec<Vec<u8>>) -> Self {
        Self {
            directory,
            connection_messages: vec![messages],
            message_delay: None,
            close_after_stream: false,
            connect_reply: None,
            max_connections: 1,
        }
    }
}

/// PDS server stand-in.
pub struct NaqsServer {
    addr: SocketAddr,
    captured: Captured,
}

impl NaqsServer {
    pub async fn start(config: NaqsConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Captured::default();

        let c = captured.clone();
        tokio::spawn(async move {
            for _ in 0..config.max_connections {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn = c.open();
                Self::handle(stream, &config, conn, &c).await;
            }
        });

        Self { addr, captured }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn captured(&self) -> &Captured {
        &self.captured
    }

    async fn handle(stream: TcpStream, config: &NaqsConfig, conn: usize, captured: &Captured) {
        let (mut reader, mut writer) = stream.into_split();

        while let Some(request) = read_request(&mut reader).await {
            captured.record(conn, request.clone());
            match request {
                Request::Connect => {
                    let reply = config.connect_reply.clone().unwrap_or_else(|| {
                        encode_message(MessageType::ChannelList, &config.directory.to_body())
                    });
                    if !write_all(&mut writer, &[reply], None).await {
                        return;
                    }
                }
                Request::AddTimeSeriesChannels { .. } => {
                    let messages = config
                        .connection_messages
                        .get(conn)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    if !write_all(&mut writer, messages, config.message_delay).await {
                        return;
                    }
                    if config.close_after_stream {
                        return;
                    }
                }
                Request::TerminateSubscription { .. } => return,
                _ => {}
            }
        }
    }
}

pub struct DataServerConfig {
    pub connection_time: i32,
    pub directory: ChannelDirectory,
    pub precis: Vec<PrecisEntry>,
    /// Messages answering a DataRequest for each key. Every answer ends
    /// with READY.
    pub data: Vec<(u32, Vec<Vec<u8>>)>,
    /// Expected password. `None` accepts any login.
    pub password: Option<String>,
    /// Messages sent after a successful login, before READY.
    pub before_ready: Vec<Vec<u8>>,
    pub max_connections: usize,
}

impl DataServerConfig {
    pub fn new(directory: ChannelDirectory) -> Self {
        Self {
            connection_time: 1_700_000_000,
            directory,
            precis: Vec::new(),
            data: Vec::new(),
            password: None,
            before_ready: Vec::new(),
            max_connections: 1,
        }
    }
}

/// DAP server stand-in.
pub struct DataServer {
    addr: SocketAddr,
    captured: Captured,
}

impl DataServer {
    pub async fn start(config: DataServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Captured::default();

        let c = captured.clone();
        tokio::spawn(async move {
            for _ in 0..config.max_connections {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn = c.open();
                Self::handle(stream, &config, conn, &c).await;
            }
        });

        Self { addr, captured }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn captured(&self) -> &Captured {
        &self.captured
    }

    async fn handle(stream: TcpStream, config: &DataServerConfig, conn: usize, captured: &Captured) {
        let (mut reader, mut writer) = stream.into_split();
        let token = config.connection_time.to_be_bytes().to_vec();
        if !write_all(&mut writer, &[token], None).await {
            return;
        }

        while let Some(request) = read_request(&mut reader).await {
            captured.record(conn, request.clone());
            let reply = match request {
                Request::ConnectRequest {
                    username,
                    connection_time,
                    crc32,
                } => {
                    let accepted = match &config.password {
                        Some(password) => {
                            connection_time == config.connection_time
                                && matches!(
                                    Request::connect_request(&username, password, connection_time),
                                    Ok(Request::ConnectRequest { crc32: expected, .. }) if expected == crc32
                                )
                        }
                        None => true,
                    };
                    if !accepted {
                        let _ = write_all(&mut writer, &[error_message("authentication failed")], None).await;
                        return;
                    }
                    let mut reply = config.before_ready.clone();
                    reply.push(ready_message());
                    reply
                }
                Request::ChannelListRequest => {
                    vec![encode_message(MessageType::ChannelList, &config.directory.to_body())]
                }
                Request::PrecisListRequest { .. } => {
                    vec![encode_message(MessageType::PrecisList, &encode_precis_list(&config.precis))]
                }
                Request::DataRequest { key, .. } => {
                    let mut reply: Vec<Vec<u8>> = config
                        .data
                        .iter()
                        .filter(|(k, _)| *k == key)
                        .flat_map(|(_, msgs)| msgs.iter().cloned())
                        .collect();
                    reply.push(ready_message());
                    reply
                }
                Request::TerminateSubscription { .. } => return,
                _ => Vec::new(),
            };
            if !write_all(&mut writer, &reply, None).await {
                return;
            }
        }
    }
}
