/*!
Minimal MQTT 3.1.1 broker on a local TCP port

Speaks just enough of the protocol for one client connection at a time:
CONNACK, SUBACK, UNSUBACK and PINGRESP replies, server-side PUBLISH, and a
log of every packet the client sent. `drop_connection` closes the socket so
reconnect paths can be exercised.
*/

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Packet received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerPacket {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    PingReq,
    PubAck(u16),
    Disconnect,
    Other(u8),
}

#[derive(Default)]
struct Session {
    packets: Vec<BrokerPacket>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    next_packet_id: u16,
}

pub struct FakeBroker {
    addr: SocketAddr,
    session: Arc<Mutex<Session>>,
    kick: Arc<Notify>,
    acceptor: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let session = Arc::new(Mutex::new(Session::default()));
        let kick = Arc::new(Notify::new());

        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&session), Arc::clone(&kick)));
        log::info!("🧪 [BROKER] Listening on {}", addr);
        Ok(Self {
            addr,
            session,
            kick,
            acceptor,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn packets(&self) -> Vec<BrokerPacket> {
        self.session.lock().packets.clone()
    }

    pub fn count(&self, matches: impl Fn(&BrokerPacket) -> bool) -> usize {
        self.session.lock().packets.iter().filter(|p| matches(p)).count()
    }

    pub fn connects(&self) -> usize {
        self.count(|p| *p == BrokerPacket::Connect)
    }

    pub fn pings(&self) -> usize {
        self.count(|p| *p == BrokerPacket::PingReq)
    }

    pub fn pubacks(&self) -> usize {
        self.count(|p| matches!(p, BrokerPacket::PubAck(_)))
    }

    pub fn subscribes(&self, topic: &str) -> usize {
        self.count(|p| matches!(p, BrokerPacket::Subscribe(t) if t == topic))
    }

    pub fn unsubscribes(&self, topic: &str) -> usize {
        self.count(|p| matches!(p, BrokerPacket::Unsubscribe(t) if t == topic))
    }

    /// Send a PUBLISH on the current connection. QoS 1 when `at_least_once`.
    /// False if no client is connected.
    pub fn publish(&self, topic: &str, payload: &[u8], at_least_once: bool) -> bool {
        let mut session = self.session.lock();
        let packet_id = if at_least_once {
            session.next_packet_id = session.next_packet_id.wrapping_add(1).max(1);
            Some(session.next_packet_id)
        } else {
            None
        };
        let Some(writer) = session.writer.as_ref() else {
            return false;
        };
        writer.send(encode_publish(topic, payload, packet_id)).is_ok()
    }

    /// Close the current client socket
    pub fn drop_connection(&self) {
        self.kick.notify_waiters();
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.kick.notify_waiters();
    }
}

async fn accept_loop(listener: TcpListener, session: Arc<Mutex<Session>>, kick: Arc<Notify>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, Arc::clone(&session), Arc::clone(&kick)));
    }
}

async fn serve(stream: TcpStream, session: Arc<Mutex<Session>>, kick: Arc<Notify>) {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let own_writer = out_tx.clone();
    session.lock().writer = Some(out_tx.clone());

    let mut reader_task = tokio::spawn(read_packets(reader, Arc::clone(&session), out_tx));
    loop {
        tokio::select! {
            _ = kick.notified() => {
                log::info!("🔌 [BROKER] Dropping client connection");
                break;
            }
            _ = &mut reader_task => break,
            bytes = out_rx.recv() => {
                let Some(bytes) = bytes else { break };
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        }
    }
    reader_task.abort();
    let mut session = session.lock();
    if session.writer.as_ref().is_some_and(|w| w.same_channel(&own_writer)) {
        session.writer = None;
    }
}

async fn read_packets(
    mut reader: OwnedReadHalf,
    session: Arc<Mutex<Session>>,
    out: mpsc::UnboundedSender<Vec<u8>>,
) -> io::Result<()> {
    loop {
        let header = reader.read_u8().await?;
        let length = read_remaining_length(&mut reader).await?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;

        let (packet, reply) = match header {
            0x10 => (BrokerPacket::Connect, Some(vec![0x20, 0x02, 0x00, 0x00])),
            0x82 => {
                let topic = read_string(&body, 2);
                (
                    BrokerPacket::Subscribe(topic),
                    Some(vec![0x90, 0x03, body[0], body[1], 0x01]),
                )
            }
            0xA2 => {
                let topic = read_string(&body, 2);
                (BrokerPacket::Unsubscribe(topic), Some(vec![0xB0, 0x02, body[0], body[1]]))
            }
            0xC0 => (BrokerPacket::PingReq, Some(vec![0xD0, 0x00])),
            0x40 => (BrokerPacket::PubAck(u16::from_be_bytes([body[0], body[1]])), None),
            0xE0 => (BrokerPacket::Disconnect, None),
            other => (BrokerPacket::Other(other), None),
        };

        log::debug!("📥 [BROKER] {:?}", packet);
        let disconnect = packet == BrokerPacket::Disconnect;
        session.lock().packets.push(packet);
        if let Some(reply) = reply {
            if out.send(reply).is_err() {
                return Ok(());
            }
        }
        if disconnect {
            return Ok(());
        }
    }
}

async fn read_remaining_length(reader: &mut OwnedReadHalf) -> io::Result<usize> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length overflow"));
        }
    }
}

/// Length-prefixed UTF-8 string at `offset`
fn read_string(body: &[u8], offset: usize) -> String {
    let len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    String::from_utf8_lossy(&body[offset + 2..offset + 2 + len]).into_owned()
}

fn encode_publish(topic: &str, payload: &[u8], packet_id: Option<u16>) -> Vec<u8> {
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 4);
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if let Some(id) = packet_id {
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(payload);

    let mut packet = vec![if packet_id.is_some() { 0x32 } else { 0x30 }];
    let mut length = body.len();
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if length == 0 {
            break;
        }
    }
    packet.extend_from_slice(&body);
    packet
}
