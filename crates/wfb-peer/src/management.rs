//! `ManagementPeer` — dual TCP management channel (spec.md §4.5): an
//! outbound client, an inbound server, framing that differs for loopback
//! vs wire peers, FIFO request/response matching per direction, and the
//! fallback routing that lets GS answer through whichever direction is
//! actually open.
//!
//! Both the outbound and inbound sockets are modeled by the same
//! `ManagementConnection<S>` type — a bidirectional request/response
//! multiplexer generic over `AsyncRead + AsyncWrite` so tests can drive it
//! over `tokio::io::duplex` instead of real sockets (spec.md §9.4's
//! fake-transport convention). This is what makes "hijack the inbound
//! socket to deliver one request and await one reply" (spec.md §4.5
//! fallback routing) just another call to the same `send_command` method.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use wfb_common::protocol::{Command, Response};

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("connection closed while awaiting response")]
    ConnectionLost,
    #[error("no response within timeout")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON on the wire: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Framing discipline (spec.md §4.5): loopback peers (tooling connecting to
/// the server socket) get a 4-byte big-endian length prefix; cross-host
/// wire peers get bare, back-to-back JSON documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    LengthPrefixed,
    Bare,
}

impl Framing {
    pub fn for_peer(addr: IpAddr) -> Self {
        if addr.is_loopback() {
            Framing::LengthPrefixed
        } else {
            Framing::Bare
        }
    }
}

/// An inbound `Command` this connection received, paired with a one-shot
/// to deliver the `Response` back onto the same socket.
pub struct InboundRequest {
    pub command: Command,
    pub respond: oneshot::Sender<Response>,
}

/// One untyped message on the wire — a request or a reply, distinguished
/// by which of `"command"`/`"status"` the JSON object carries (spec.md §9
/// design note: "tagged message union... one decoder").
#[derive(Debug, Clone)]
enum WireMessage {
    Command(Command),
    Response(Response),
}

impl WireMessage {
    fn parse(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.get("command").is_some() {
            Ok(WireMessage::Command(serde_json::from_value(value)?))
        } else {
            Ok(WireMessage::Response(serde_json::from_value(value)?))
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            WireMessage::Command(c) => serde_json::to_value(c).expect("Command always serializes"),
            WireMessage::Response(r) => serde_json::to_value(r).expect("Response always serializes"),
        }
    }
}

type Fifo = Arc<Mutex<VecDeque<oneshot::Sender<Response>>>>;

/// A live, bidirectional management socket: send commands and await
/// responses (FIFO per direction, invariant (a)/(c) of spec.md §4.5), while
/// a background task answers whatever commands the peer sends us by
/// forwarding them to `inbound_tx` and writing back whatever response it
/// produces.
///
/// `Clone` is cheap (it's a handle to the same shared write-half/FIFO) and
/// is what lets the orchestrator hand out independent send-and-await tasks
/// (init retry, `freq_sel_hop`, config sync) without holding the connection
/// itself behind a lock for their duration.
#[derive(Clone)]
pub struct ManagementConnection {
    write_half: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Fifo,
    framing: Framing,
}

impl ManagementConnection {
    pub fn spawn_tcp(
        stream: TcpStream,
        framing: Framing,
        inbound_tx: mpsc::Sender<InboundRequest>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let _ = stream.set_nodelay(true);
        Self::spawn(stream, framing, inbound_tx)
    }

    pub fn spawn<S>(
        stream: S,
        framing: Framing,
        inbound_tx: mpsc::Sender<InboundRequest>,
    ) -> (Self, tokio::task::JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = split(stream);
        let pending: Fifo = Arc::new(Mutex::new(VecDeque::new()));
        let write_half: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>> =
            Arc::new(Mutex::new(Box::new(write_half)));

        let conn = ManagementConnection {
            write_half: write_half.clone(),
            pending: pending.clone(),
            framing,
        };

        let handle = tokio::spawn(read_loop(read_half, framing, pending, write_half, inbound_tx));
        (conn, handle)
    }

    /// Send a command over this connection and await the single matching
    /// response, FIFO-ordered with any other in-flight request on this
    /// same direction (spec.md §4.5 invariant (a)).
    pub async fn send_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Response, ManagementError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push_back(tx);
        self.write(&WireMessage::Command(command)).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ManagementError::ConnectionLost),
            Err(_) => Err(ManagementError::Timeout),
        }
    }

    async fn write(&self, msg: &WireMessage) -> Result<(), ManagementError> {
        let json = serde_json::to_vec(&msg.to_json())?;
        let mut w = self.write_half.lock().await;
        match self.framing {
            Framing::LengthPrefixed => {
                w.write_all(&(json.len() as u32).to_be_bytes()).await?;
            }
            Framing::Bare => {}
        }
        w.write_all(&json).await?;
        w.flush().await?;
        Ok(())
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    write_half: &Arc<Mutex<W>>,
    framing: Framing,
    response: Response,
) -> std::io::Result<()> {
    let json = serde_json::to_vec(&WireMessage::Response(response).to_json()).expect("Response always serializes");
    let mut w = write_half.lock().await;
    if framing == Framing::LengthPrefixed {
        w.write_all(&(json.len() as u32).to_be_bytes()).await?;
    }
    w.write_all(&json).await?;
    w.flush().await
}

async fn read_loop<R: AsyncRead + Unpin, W: AsyncWrite + Send + Unpin + 'static>(
    mut read_half: R,
    framing: Framing,
    pending: Fifo,
    write_half: Arc<Mutex<W>>,
    inbound_tx: mpsc::Sender<InboundRequest>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let message = match framing {
            Framing::LengthPrefixed => read_length_prefixed(&mut read_half).await,
            Framing::Bare => read_bare_one(&mut read_half, &mut buf, &mut chunk).await,
        };
        let value = match message {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "management connection read error");
                break;
            }
        };
        match WireMessage::parse(value) {
            Ok(WireMessage::Response(resp)) => {
                let sender = pending.lock().await.pop_front();
                if let Some(sender) = sender {
                    let _ = sender.send(resp);
                } else {
                    warn!("unsolicited response with no matching request, discarding");
                }
            }
            Ok(WireMessage::Command(cmd)) => {
                let (tx, rx) = oneshot::channel();
                if inbound_tx
                    .send(InboundRequest {
                        command: cmd,
                        respond: tx,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                let write_half = write_half.clone();
                tokio::spawn(async move {
                    if let Ok(response) = rx.await {
                        let _ = write_response(&write_half, framing, response).await;
                    }
                });
            }
            Err(e) => {
                debug!(error = %e, "malformed management message, discarding");
            }
        }
    }
    // Connection closed: fail every outstanding local request (invariant (b)).
    let mut pending = pending.lock().await;
    while let Some(sender) = pending.pop_front() {
        drop(sender); // dropping without sending completes the oneshot as an error
    }
}

async fn read_length_prefixed<R: AsyncRead + Unpin>(
    read_half: &mut R,
) -> std::io::Result<Option<serde_json::Value>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Bare framing: documents are back-to-back with no delimiter, so we parse
/// lazily from an accumulating buffer and keep whatever trailing bytes
/// didn't form a complete document yet (spec.md §4.5).
async fn read_bare_one<R: AsyncRead + Unpin>(
    read_half: &mut R,
    buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> std::io::Result<Option<serde_json::Value>> {
    loop {
        if !buf.is_empty() {
            let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<serde_json::Value>();
            if let Some(result) = de.next() {
                match result {
                    Ok(value) => {
                        let consumed = de.byte_offset();
                        buf.drain(0..consumed);
                        return Ok(Some(value));
                    }
                    Err(e) if e.is_eof() => {
                        // Incomplete document; fall through and read more.
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let n = read_half.read(chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfb_common::protocol::{FreqSelInfo, LinkStateName, ResponseStatus};

    fn respond_success(mut rx: mpsc::Receiver<InboundRequest>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.respond.send(Response::ok());
            }
        })
    }

    #[tokio::test]
    async fn length_prefixed_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (conn_a, _ha) = ManagementConnection::spawn(a, Framing::LengthPrefixed, tx_a);
        let (_conn_b, _hb) = ManagementConnection::spawn(b, Framing::LengthPrefixed, tx_b);
        let _responder = respond_success(rx_b);
        let _unused = rx_a;

        let resp = conn_a
            .send_command(Command::FreqSelHop, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Success);
    }

    #[tokio::test]
    async fn bare_framing_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (conn_a, _ha) = ManagementConnection::spawn(a, Framing::Bare, tx_a);
        let (_conn_b, _hb) = ManagementConnection::spawn(b, Framing::Bare, tx_b);
        let _responder = respond_success(rx_b);
        let _unused = rx_a;

        let resp = conn_a
            .send_command(
                Command::Init {
                    freq_sel: FreqSelInfo { enabled: true },
                    status: LinkStateName::Waiting,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Success);
    }

    #[tokio::test]
    async fn fifo_ordering_of_two_in_flight_requests() {
        let (a, b) = tokio::io::duplex(8192);
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (conn_a, _ha) = ManagementConnection::spawn(a, Framing::LengthPrefixed, tx_a);
        let (_conn_b, _hb) = ManagementConnection::spawn(b, Framing::LengthPrefixed, tx_b);
        let _unused = rx_a;

        let conn_a = Arc::new(conn_a);
        let c1 = conn_a.clone();
        let fut1 = tokio::spawn(async move {
            c1.send_command(Command::FreqSelHop, Duration::from_secs(2))
                .await
        });
        let c2 = conn_a.clone();
        let fut2 = tokio::spawn(async move {
            c2.send_command(Command::GetConfigHash, Duration::from_secs(2))
                .await
        });

        // Answer in FIFO order with distinguishable responses.
        let req1 = rx_b.recv().await.unwrap();
        let _ = req1.respond.send(Response::ok_with_time(1.0));
        let req2 = rx_b.recv().await.unwrap();
        let _ = req2.respond.send(Response::ok_with_time(2.0));

        let r1 = fut1.await.unwrap().unwrap();
        let r2 = fut2.await.unwrap().unwrap();
        assert_eq!(r1.time, Some(1.0));
        assert_eq!(r2.time, Some(2.0));
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_request() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx_a, rx_a) = mpsc::channel(8);
        let (conn_a, _ha) = ManagementConnection::spawn(a, Framing::LengthPrefixed, tx_a);
        let _unused = rx_a;
        drop(b); // peer disappears before answering

        let err = conn_a
            .send_command(Command::FreqSelHop, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagementError::ConnectionLost));
    }

    #[tokio::test]
    async fn boundary_13_freq_sel_hop_disabled_returns_error() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (conn_a, _ha) = ManagementConnection::spawn(a, Framing::LengthPrefixed, tx_a);
        let (_conn_b, _hb) = ManagementConnection::spawn(b, Framing::LengthPrefixed, tx_b);
        let _unused = rx_a;
        let _responder = tokio::spawn(async move {
            let req = rx_b.recv().await.unwrap();
            let _ = req
                .respond
                .send(Response::error("is_enabled()==false"));
        });

        let resp = conn_a
            .send_command(Command::FreqSelHop, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Error);
    }
}
