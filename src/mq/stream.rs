//! Socket plumbing shared by the stream client and server.
//!
//! Each connection runs two tasks on the node's loop:
//! - a reader decoding frames and delivering them through [`MqBase::deliver`],
//! - a writer draining [`WriteJob`]s one at a time, so a stream never has two
//!   writes outstanding.
//!
//! Both report their end through a [`StreamEvent`] so the transport can drop
//! the connection, reconnect or close.

use super::base::MqBase;
use super::codec::{FrameReader, MsgPacker};
use super::message::{MqId, MqMsg};
use super::params::{MqParams, MqType};
use super::MqRequestState;
use crate::error::{MqError, MqResult};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connected socket of either stream flavour.
pub(crate) enum StreamSocket {
    Tcp(TcpStream),
    Pipe(UnixStream),
}

impl StreamSocket {
    /// Connects to the endpoint described by `params`.
    pub(crate) async fn connect(params: &MqParams) -> io::Result<Self> {
        match params.mq_type {
            MqType::Tcp => {
                let stream = TcpStream::connect(params.endpoint()).await?;
                stream.set_nodelay(true)?;
                Ok(StreamSocket::Tcp(stream))
            }
            MqType::Pipe => Ok(StreamSocket::Pipe(UnixStream::connect(&params.address).await?)),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not a stream transport", other),
            )),
        }
    }

    fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            StreamSocket::Tcp(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            StreamSocket::Pipe(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

/// Listening socket of a bound stream node.
pub(crate) enum StreamListener {
    Tcp(TcpListener),
    /// The path is unlinked when the listener is dropped.
    Pipe(UnixListener, PathBuf),
}

impl StreamListener {
    /// Binds according to `params`. TCP listeners honour `tcp_ipv6_only`; a
    /// stale socket file is removed before binding a pipe.
    pub(crate) fn bind(params: &MqParams) -> io::Result<Self> {
        match params.mq_type {
            MqType::Tcp => {
                let addr: SocketAddr = params.endpoint().parse().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid bind address {}: {}", params.endpoint(), e),
                    )
                })?;
                let domain = socket2::Domain::for_address(addr);
                let socket =
                    socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
                if addr.is_ipv6() {
                    socket.set_only_v6(params.tcp_ipv6_only)?;
                }
                socket.set_reuse_address(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&addr.into())?;
                socket.listen(1024)?;
                let listener = TcpListener::from_std(socket.into())?;
                Ok(StreamListener::Tcp(listener))
            }
            MqType::Pipe => {
                let path = PathBuf::from(&params.address);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove stale socket file {:?}: {}", path, e);
                    }
                }
                let listener = UnixListener::bind(&path)?;
                Ok(StreamListener::Pipe(listener, path))
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not a stream transport", other),
            )),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            StreamListener::Tcp(listener) => listener.local_addr().ok(),
            StreamListener::Pipe(..) => None,
        }
    }

    /// Cancel safe.
    pub(crate) async fn accept(&self) -> io::Result<(StreamSocket, String)> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((StreamSocket::Tcp(stream), addr.to_string()))
            }
            StreamListener::Pipe(listener, path) => {
                let (stream, addr) = listener.accept().await?;
                let peer = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                Ok((StreamSocket::Pipe(stream), peer))
            }
        }
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if let StreamListener::Pipe(_, path) = self {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {:?}: {}", path, e);
                }
            }
        }
    }
}

/// One target's share of a queued slot.
///
/// Every target of a broadcast holds a lease over the same slot; the slot goes
/// back to the ready queue when the last lease is dropped, whether the write
/// happened or the writer was torn down.
pub(crate) struct SlotLease {
    base: Arc<MqBase>,
    slot: usize,
    remaining: Arc<AtomicUsize>,
}

impl SlotLease {
    /// Splits `slot` into `count` leases. With `count == 0` the caller still
    /// owns the slot.
    pub(crate) fn share(base: &Arc<MqBase>, slot: usize, count: usize) -> Vec<SlotLease> {
        let remaining = Arc::new(AtomicUsize::new(count));
        (0..count)
            .map(|_| SlotLease {
                base: base.clone(),
                slot,
                remaining: remaining.clone(),
            })
            .collect()
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.base.restore(self.slot);
        }
    }
}

/// Work item of a connection writer.
pub(crate) enum WriteJob {
    Msg(SlotLease),
    /// Shut down the write side.
    Shutdown,
}

/// End of a connection, reported by its reader or writer.
#[derive(Debug)]
pub(crate) struct StreamEvent {
    pub id: MqId,
    pub error: Option<MqError>,
}

/// One live stream with its reader and writer tasks.
pub(crate) struct StreamConnection {
    id: MqId,
    peer: String,
    jobs: mpsc::UnboundedSender<WriteJob>,
    request_state: Arc<AtomicU8>,
    /// Set once a frame was delivered or written.
    traffic: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamConnection {
    /// Spawns reader and writer tasks on the current loop.
    pub(crate) fn spawn(
        base: Arc<MqBase>,
        socket: StreamSocket,
        id: MqId,
        peer: String,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let request_state = Arc::new(AtomicU8::new(MqRequestState::Waiting as u8));
        let traffic = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            base.clone(),
            read_half,
            id,
            traffic.clone(),
            events.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            base,
            write_half,
            job_rx,
            request_state.clone(),
            traffic.clone(),
            id,
            events,
        ));

        Self {
            id,
            peer,
            jobs,
            request_state,
            traffic,
            reader,
            writer,
        }
    }

    pub(crate) fn id(&self) -> MqId {
        self.id
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn request_state(&self) -> MqRequestState {
        MqRequestState::from_u8(self.request_state.load(Ordering::Acquire))
    }

    /// Whether any message went through this connection in either direction.
    pub(crate) fn carried_traffic(&self) -> bool {
        self.traffic.load(Ordering::Acquire)
    }

    /// Queues a write. A lease the writer can no longer take is dropped here.
    pub(crate) fn write(&self, lease: SlotLease) -> bool {
        let _ = self.request_state.compare_exchange(
            MqRequestState::Waiting as u8,
            MqRequestState::Async as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.jobs.send(WriteJob::Msg(lease)).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.jobs.send(WriteJob::Shutdown);
    }

    /// Lets the writer drain its queue until `deadline`, then stops both tasks.
    pub(crate) async fn close(self, deadline: Instant) {
        let StreamConnection {
            id,
            jobs,
            reader,
            mut writer,
            ..
        } = self;
        drop(jobs);

        if timeout_at(deadline, &mut writer).await.is_err() {
            warn!("Connection {} did not drain before the close timer fired", id);
            writer.abort();
            let _ = writer.await;
        }
        reader.abort();
        let _ = reader.await;
    }
}

async fn read_loop(
    base: Arc<MqBase>,
    reader: BoxedReader,
    id: MqId,
    traffic: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let params = base.params();
    let max_errors = params.continuous_read_error_count.max(1);
    let mut frames = FrameReader::new(reader, params.recv_msg_size);
    let mut msg = MqMsg::with_capacity(params.packer_size);
    let mut continuous_errors = 0;

    let error = loop {
        match frames.read_frame().await {
            Ok(Some(body)) => match MsgPacker::unpack(body, &mut msg) {
                Ok(()) if msg.event.is_control() => {
                    continuous_errors = 0;
                    debug!("Ignoring {:?} frame from connection {}", msg.event, id);
                }
                Ok(()) => {
                    continuous_errors = 0;
                    traffic.store(true, Ordering::Release);
                    msg.id = id;
                    base.deliver(&msg);
                }
                Err(e) => {
                    continuous_errors += 1;
                    warn!(
                        "Undecodable frame from connection {} ({}/{}): {}",
                        id, continuous_errors, max_errors, e
                    );
                    if continuous_errors >= max_errors {
                        break Some(e);
                    }
                }
            },
            Ok(None) => {
                debug!("Connection {} closed by peer", id);
                break None;
            }
            Err(e) => {
                debug!("Connection {} read error: {}", id, e);
                break Some(MqError::Io(e));
            }
        }
    };
    let _ = events.send(StreamEvent { id, error });
}

async fn write_loop(
    base: Arc<MqBase>,
    mut writer: BoxedWriter,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    request_state: Arc<AtomicU8>,
    traffic: Arc<AtomicBool>,
    id: MqId,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut packer = MsgPacker::new(base.params().packer_size);
    let mut failure = None;

    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Msg(lease) => {
                request_state.store(MqRequestState::Requesting as u8, Ordering::Release);
                let result = write_slot(&base, &mut packer, &mut writer, lease.slot()).await;
                drop(lease);

                let next = if jobs.is_empty() {
                    MqRequestState::Waiting
                } else {
                    MqRequestState::Async
                };
                request_state.store(next as u8, Ordering::Release);

                match result {
                    Ok(()) => traffic.store(true, Ordering::Release),
                    Err(MqError::Io(e)) => {
                        debug!("Connection {} write error: {}", id, e);
                        failure = Some(MqError::Io(e));
                        break;
                    }
                    Err(e) => error!("Dropping message for connection {}: {}", id, e),
                }
            }
            WriteJob::Shutdown => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Connection {} shutdown error: {}", id, e);
                }
            }
        }
    }

    // Leases of jobs that will never be written go back with the receiver.
    drop(jobs);
    request_state.store(MqRequestState::Waiting as u8, Ordering::Release);

    if failure.is_some() {
        let _ = events.send(StreamEvent { id, error: failure });
    } else {
        let _ = writer.shutdown().await;
    }
}

async fn write_slot(
    base: &MqBase,
    packer: &mut MsgPacker,
    writer: &mut BoxedWriter,
    slot: usize,
) -> MqResult<()> {
    let frame = packer.pack(&base.events().slot(slot))?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::DefaultInternal;
    use crate::mq::event_queue::SlotSignals;
    use std::time::Duration;

    fn running_base(params: MqParams) -> (Arc<MqBase>, SlotSignals) {
        let (base, signals) = MqBase::new(params, Arc::new(DefaultInternal)).unwrap();
        base.set_running();
        (base, signals)
    }

    async fn recv_within(base: &MqBase, timeout: Duration) -> Option<MqMsg> {
        let deadline = Instant::now() + timeout;
        let mut msg = MqMsg::default();
        while Instant::now() < deadline {
            if base.recv(&mut msg).is_ok() {
                return Some(msg);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_connection_writes_and_restores_slot() {
        let listener = StreamListener::bind(&MqParams::tcp("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client_base, mut client_signals) = running_base(MqParams::tcp("127.0.0.1", port));
        let (server_base, _server_signals) = running_base(MqParams::tcp("127.0.0.1", port));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let socket = StreamSocket::connect(client_base.params()).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1"));

        let client = StreamConnection::spawn(
            client_base.clone(),
            socket,
            1,
            "server".into(),
            events_tx.clone(),
        );
        let server = StreamConnection::spawn(server_base.clone(), accepted, 7, peer, events_tx);

        client_base.send(&MqMsg::from("hello")).unwrap();
        let slot = client_signals.recv().await.unwrap();
        for lease in SlotLease::share(&client_base, slot, 1) {
            assert!(client.write(lease));
        }

        let msg = recv_within(&server_base, Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.as_str(), Some("hello"));
        assert_eq!(msg.id, 7);
        assert!(server.carried_traffic());

        let deadline = Instant::now() + Duration::from_secs(1);
        client.close(deadline).await;
        server.close(deadline).await;
        assert_eq!(client_base.events().ready_len(), client_base.events().size());
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let listener = StreamListener::bind(&MqParams::tcp("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let (base, _signals) = running_base(MqParams::tcp("127.0.0.1", port));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let socket = StreamSocket::connect(base.params()).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        let server = StreamConnection::spawn(base.clone(), accepted, 3, peer, events_tx);
        drop(socket);

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, 3);
        assert!(event.error.is_none());
        assert!(!server.carried_traffic());
        server.close(Instant::now()).await;
    }

    #[tokio::test]
    async fn test_shared_lease_restores_once() {
        let (base, mut signals) = running_base(MqParams::local("lease"));
        base.send(&MqMsg::from("x")).unwrap();
        let slot = signals.recv().await.unwrap();

        let mut leases = SlotLease::share(&base, slot, 3);
        assert_eq!(base.events().in_flight_len(), 1);
        leases.truncate(1);
        assert_eq!(base.events().in_flight_len(), 1);
        drop(leases);
        assert_eq!(base.events().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_pipe_listener_unlinks_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        let params = MqParams::pipe(path.to_string_lossy());

        std::fs::write(&path, b"stale").unwrap();
        let listener = StreamListener::bind(&params).unwrap();
        assert!(path.exists());
        assert!(listener.local_addr().is_none());

        drop(listener);
        assert!(!path.exists());
    }
}
