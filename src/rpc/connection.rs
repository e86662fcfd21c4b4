use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::buffer::WriteQueue;
use super::envelope::{Envelope, FrameDecoder};
use crate::error::{DistbuildError, Result};

pub type ConnectionId = u32;

/// Id of a client's single outbound link.
pub const CLIENT_CONNECTION_ID: ConnectionId = 0;

/// Continuation for an outbound call, invoked with the raw response payload.
pub type ResponseCallback = Box<dyn FnOnce(ConnectionId, Vec<u8>) + Send>;

/// Posted by a connection's I/O task to the RPC loop.
#[derive(Debug)]
pub(crate) enum NetEvent {
    Frame {
        connection: ConnectionId,
        envelope: Envelope,
    },
    Closed {
        connection: ConnectionId,
        reason: String,
    },
}

/// One peer link, owned by the RPC loop.
///
/// The socket itself lives in a dedicated I/O task; this record keeps the
/// call bookkeeping and the handles used to feed and stop that task.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    next_request_id: u32,
    pending_calls: HashMap<u32, ResponseCallback>,
    closing: bool,
}

impl Connection {
    pub(crate) fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        max_buffer_size: usize,
        events: mpsc::UnboundedSender<NetEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_io(
            id,
            stream,
            outbound_rx,
            events,
            cancel.clone(),
            max_buffer_size,
        ));

        Self {
            id,
            peer,
            outbound,
            cancel,
            next_request_id: 0,
            pending_calls: HashMap::new(),
            closing: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Queues a request and records its continuation. Returns the request id.
    pub(crate) fn send_request(
        &mut self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        on_response: ResponseCallback,
    ) -> Result<u32> {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let id = self.next_request_id;
        self.write(Envelope::request(id, service, method, payload).to_frame())?;
        self.pending_calls.insert(id, on_response);
        Ok(id)
    }

    pub(crate) fn send_response(
        &mut self,
        id: u32,
        service: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.write(Envelope::response(id, service, method, payload).to_frame())
    }

    pub(crate) fn take_pending_call(&mut self, id: u32) -> Option<ResponseCallback> {
        self.pending_calls.remove(&id)
    }

    /// Stops the I/O task. The record stays until its `Closed` event arrives.
    pub(crate) fn close(&mut self) {
        self.closing = true;
        self.cancel.cancel();
    }

    fn write(&self, frame: Vec<u8>) -> Result<()> {
        if self.closing {
            return Err(DistbuildError::ConnectionNotFound(self.id));
        }
        self.outbound
            .send(frame)
            .map_err(|_| DistbuildError::ConnectionNotFound(self.id))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.pending_calls.is_empty() {
            tracing::debug!(
                connection = self.id,
                abandoned = self.pending_calls.len(),
                "Abandoning pending calls"
            );
        }
        self.cancel.cancel();
    }
}

/// Readiness-driven socket loop for one connection.
async fn run_io(
    id: ConnectionId,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<NetEvent>,
    cancel: CancellationToken,
    max_buffer_size: usize,
) {
    let mut decoder = FrameDecoder::new(max_buffer_size);
    let mut queue = WriteQueue::new(max_buffer_size);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if queue.push(frame).is_err() {
                        break;
                    }
                }
                if !queue.is_empty() {
                    let _ = tokio::time::timeout(
                        Duration::from_secs(1),
                        flush_all(&stream, &mut queue),
                    )
                    .await;
                }
                break "closed locally".to_string();
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    // An oversized frame is refused on its own; the link stays up.
                    if let Err(e) = queue.push(frame) {
                        tracing::warn!(connection = id, error = %e, "Dropping outbound frame");
                        continue;
                    }
                    if let Err(e) = flush_available(&stream, &mut queue) {
                        break e.to_string();
                    }
                }
                None => break "connection dropped".to_string(),
            },
            ready = stream.readable() => {
                if let Err(e) = ready {
                    break e.to_string();
                }
                match read_available(&stream, &mut decoder) {
                    Ok(read) => {
                        for envelope in read.envelopes {
                            let _ = events.send(NetEvent::Frame { connection: id, envelope });
                        }
                        if read.eof {
                            break "peer closed".to_string();
                        }
                    }
                    Err(e) => break e.to_string(),
                }
            }
            ready = stream.writable(), if !queue.is_empty() => {
                if let Err(e) = ready {
                    break e.to_string();
                }
                if let Err(e) = flush_available(&stream, &mut queue) {
                    break e.to_string();
                }
            }
        }
    };

    tracing::debug!(connection = id, reason = %reason, "Connection I/O stopped");
    let _ = events.send(NetEvent::Closed {
        connection: id,
        reason,
    });
}

struct ReadResult {
    envelopes: Vec<Envelope>,
    eof: bool,
}

/// Reads until the socket would block, parsing every completed frame.
fn read_available(stream: &TcpStream, decoder: &mut FrameDecoder) -> Result<ReadResult> {
    let mut envelopes = Vec::new();
    loop {
        let spare = decoder.spare_mut()?;
        match stream.try_read(spare) {
            Ok(0) => return Ok(ReadResult { envelopes, eof: true }),
            Ok(n) => {
                decoder.did_read(n);
                while let Some(envelope) = decoder.next_envelope()? {
                    envelopes.push(envelope);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadResult {
        envelopes,
        eof: false,
    })
}

/// Writes queued frames until the queue drains or the socket would block.
fn flush_available(stream: &TcpStream, queue: &mut WriteQueue) -> io::Result<()> {
    while let Some(chunk) = queue.front_chunk() {
        match stream.try_write(chunk) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => queue.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn flush_all(stream: &TcpStream, queue: &mut WriteQueue) -> io::Result<()> {
    while !queue.is_empty() {
        stream.writable().await?;
        flush_available(stream, queue)?;
    }
    Ok(())
}
