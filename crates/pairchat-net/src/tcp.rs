//! TCP transport with newline-delimited JSON framing.
//!
//! The dialer opens with a [`Hello`] line carrying the role tag and its own
//! listening address; the acceptor answers with a [`HelloAck`]. After that
//! each line is one encoded [`Frame`]. Connection I/O runs in background
//! tokio tasks; the [`Transport`] methods only enqueue work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use pairchat_shared::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use pairchat_shared::protocol::Frame;
use pairchat_shared::types::{ConnectionId, ConnectionRole, PeerAddress};

use crate::error::{NetError, Result};
use crate::transport::{Transport, TransportEvent};

/// First line sent by the dialer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    version: String,
    role: ConnectionRole,
    from: PeerAddress,
}

/// Acceptor's answer to a [`Hello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloAck {
    accepted: bool,
}

enum ConnState {
    /// Outbound dial in progress.
    Dialing { task: AbortHandle },
    /// Inbound connection waiting for `accept`/`reject`.
    Pending {
        role: ConnectionRole,
        decision: oneshot::Sender<bool>,
    },
    Open {
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        reader: AbortHandle,
    },
}

type ConnTable = Arc<Mutex<HashMap<ConnectionId, ConnState>>>;

fn lock(table: &ConnTable) -> MutexGuard<'_, HashMap<ConnectionId, ConnState>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TCP implementation of [`Transport`]. Addresses are `host:port` strings.
pub struct TcpTransport {
    local: PeerAddress,
    runtime: Handle,
    conns: ConnTable,
    next_conn: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<TransportEvent>,
    listener: AbortHandle,
}

impl TcpTransport {
    /// Bind a listener and start accepting connections.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(
        addr: SocketAddr,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = PeerAddress(listener.local_addr()?.to_string());
        let (events, events_rx) = mpsc::unbounded_channel();
        let conns: ConnTable = Arc::new(Mutex::new(HashMap::new()));
        let next_conn = Arc::new(AtomicU64::new(0));
        let runtime = Handle::current();

        info!(addr = %local, "TCP transport listening");

        let accept_task = runtime.spawn(accept_loop(
            listener,
            conns.clone(),
            next_conn.clone(),
            events.clone(),
        ));

        Ok((
            Self {
                local,
                runtime,
                conns,
                next_conn,
                events,
                listener: accept_task.abort_handle(),
            },
            events_rx,
        ))
    }

    fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Transport for TcpTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn connect(&mut self, target: &PeerAddress, role: ConnectionRole) -> Result<ConnectionId> {
        let target_addr: SocketAddr = target
            .as_str()
            .parse()
            .map_err(|_| NetError::InvalidAddress(target.to_string()))?;
        let conn = self.allocate();
        let hello = Hello {
            version: PROTOCOL_VERSION.to_string(),
            role,
            from: self.local.clone(),
        };

        // The table lock is held across the spawn so the task cannot observe
        // the table before its own Dialing entry exists.
        let mut table = lock(&self.conns);
        let task = self.runtime.spawn(dial(
            conn,
            target.clone(),
            target_addr,
            hello,
            self.conns.clone(),
            self.events.clone(),
        ));
        table.insert(
            conn,
            ConnState::Dialing {
                task: task.abort_handle(),
            },
        );
        debug!(%conn, target = %target, role = role.as_tag(), "Dialing");
        Ok(conn)
    }

    fn accept(&mut self, conn: ConnectionId) -> Result<ConnectionRole> {
        let state = lock(&self.conns).remove(&conn);
        match state {
            Some(ConnState::Pending { role, decision }) => {
                decision
                    .send(true)
                    .map_err(|_| NetError::UnknownConnection(conn))?;
                Ok(role)
            }
            Some(other) => {
                lock(&self.conns).insert(conn, other);
                Err(NetError::UnknownConnection(conn))
            }
            None => Err(NetError::UnknownConnection(conn)),
        }
    }

    fn reject(&mut self, conn: ConnectionId) {
        if let Some(ConnState::Pending { decision, .. }) = lock(&self.conns).remove(&conn) {
            let _ = decision.send(false);
        }
    }

    fn send(&mut self, conn: ConnectionId, frame: &Frame) -> Result<()> {
        let data = frame.to_bytes()?;
        match lock(&self.conns).get(&conn) {
            Some(ConnState::Open { outbound, .. }) => outbound
                .send(data)
                .map_err(|_| NetError::NotOpen(conn)),
            Some(_) => Err(NetError::NotOpen(conn)),
            None => Err(NetError::UnknownConnection(conn)),
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        match lock(&self.conns).remove(&conn) {
            Some(ConnState::Dialing { task }) => task.abort(),
            Some(ConnState::Pending { decision, .. }) => {
                let _ = decision.send(false);
            }
            // Dropping `outbound` ends the writer task, which shuts the socket down.
            Some(ConnState::Open { reader, .. }) => reader.abort(),
            None => {}
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.listener.abort();
        for (_, state) in lock(&self.conns).drain() {
            match state {
                ConnState::Dialing { task } => task.abort(),
                ConnState::Open { reader, .. } => reader.abort(),
                ConnState::Pending { .. } => {}
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    conns: ConnTable,
    next_conn: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        let conn = ConnectionId(next_conn.fetch_add(1, Ordering::Relaxed) + 1);
        tokio::spawn(handle_inbound(conn, stream, remote, conns.clone(), events.clone()));
    }
}

async fn handle_inbound(
    conn: ConnectionId,
    stream: TcpStream,
    remote: SocketAddr,
    conns: ConnTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello: Hello = match read_line(&mut reader).await {
        Ok(Some(line)) => match serde_json::from_slice(&line) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Malformed hello, dropping");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            debug!(remote = %remote, error = %e, "Inbound connection failed before hello");
            return;
        }
    };

    let (decision_tx, decision_rx) = oneshot::channel();
    lock(&conns).insert(
        conn,
        ConnState::Pending {
            role: hello.role,
            decision: decision_tx,
        },
    );
    let _ = events.send(TransportEvent::Incoming {
        conn,
        peer: hello.from.clone(),
        role: hello.role,
    });

    let accepted = decision_rx.await.unwrap_or(false);
    if !send_ack(conn, &hello.from, &mut write_half, accepted, &events).await {
        return;
    }

    open_link(conn, hello.from, reader, write_half, conns, events);
}

/// Answer a [`Hello`]. Returns whether the link should be opened.
///
/// Once the engine has accepted, a failed ack write is reported as
/// [`TransportEvent::Failed`] so the accepted connection never stays pending.
async fn send_ack<W>(
    conn: ConnectionId,
    peer: &PeerAddress,
    writer: &mut W,
    accepted: bool,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    match write_line(writer, &HelloAck { accepted }).await {
        Ok(()) if accepted => true,
        Ok(()) => {
            debug!(%conn, %peer, "Inbound connection rejected");
            false
        }
        Err(e) if accepted => {
            warn!(%conn, %peer, error = %e, "Handshake ack failed after accept");
            let _ = events.send(TransportEvent::Failed {
                conn,
                error: format!("handshake ack failed: {e}"),
            });
            false
        }
        Err(e) => {
            debug!(%conn, %peer, error = %e, "Reject ack not delivered");
            false
        }
    }
}

async fn dial(
    conn: ConnectionId,
    target: PeerAddress,
    target_addr: SocketAddr,
    hello: Hello,
    conns: ConnTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let outcome = async {
        let stream = TcpStream::connect(target_addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_line(&mut write_half, &hello).await?;
        let ack: Option<HelloAck> = match read_line(&mut reader).await? {
            Some(line) => Some(serde_json::from_slice(&line).map_err(std::io::Error::from)?),
            None => None,
        };
        Ok::<_, std::io::Error>((ack, reader, write_half))
    }
    .await;

    match outcome {
        Ok((Some(HelloAck { accepted: true }), reader, writer)) => {
            if lock(&conns).remove(&conn).is_none() {
                // Closed locally while the handshake was in flight.
                return;
            }
            open_link(conn, target, reader, writer, conns, events);
        }
        Ok(_) => {
            if lock(&conns).remove(&conn).is_some() {
                debug!(%conn, target = %target, "Dial rejected by peer");
                let _ = events.send(TransportEvent::Closed { conn });
            }
        }
        Err(e) => {
            if lock(&conns).remove(&conn).is_some() {
                debug!(%conn, target = %target, error = %e, "Dial failed");
                let _ = events.send(TransportEvent::Failed {
                    conn,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Register an established link and start its reader and writer tasks.
fn open_link(
    conn: ConnectionId,
    peer: PeerAddress,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    conns: ConnTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(mut data) = outbound_rx.recv().await {
            data.push(b'\n');
            if let Err(e) = writer.write_all(&data).await {
                debug!(%conn, error = %e, "TCP write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_conns = conns.clone();
    let reader_events = events.clone();
    // Hold the table lock across the spawn so an immediate EOF cannot race
    // ahead of the Open entry.
    let mut table = lock(&conns);
    let reader_task = tokio::spawn(async move {
        let reason = loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => {
                    let _ = reader_events.send(TransportEvent::Data { conn, data: line });
                }
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };
        if lock(&reader_conns).remove(&conn).is_some() {
            let event = match reason {
                None => TransportEvent::Closed { conn },
                Some(error) => TransportEvent::Failed { conn, error },
            };
            let _ = reader_events.send(event);
        }
    });
    table.insert(
        conn,
        ConnState::Open {
            outbound: outbound_tx,
            reader: reader_task.abort_handle(),
        },
    );
    drop(table);

    debug!(%conn, peer = %peer, "TCP link open");
    let _ = events.send(TransportEvent::Opened { conn, peer });
}

/// Read one newline-terminated line, bounded by [`MAX_FRAME_SIZE`].
/// Returns `None` on a clean EOF.
async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (MAX_FRAME_SIZE + 1) as u64;
    let n = reader.take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large or truncated",
        ));
    }
    buf.pop();
    Ok(Some(buf))
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value).map_err(std::io::Error::from)?;
    line.push(b'\n');
    writer.write_all(&line).await
}
