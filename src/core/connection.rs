use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, instrument};

use super::command::Cmd;
use super::{Connection, Connector, Endpoint, Error, Result};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;

/// Default number of requests that may wait for the writer task.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

type ReplyTx = oneshot::Sender<Result<Vec<Frame>>>;

/// A batch of frames written back to back.
struct Request {
    frames: Vec<Frame>,
    response_tx: ReplyTx,
}

/// Tells the reader how many replies belong to the next batch.
struct Waiter {
    expected: usize,
    response_tx: ReplyTx,
}

/// A handle to a multiplexed RESP connection.
///
/// Cheap to clone; all clones share one socket. A writer task encodes
/// requests in submission order and a reader task matches replies to
/// waiters in the same order.
#[derive(Clone)]
pub struct MultiplexedConnection {
    address: Arc<str>,
    sender: mpsc::Sender<Request>,
    closed: Arc<watch::Sender<bool>>,
}

impl MultiplexedConnection {
    /// Spawns the reader and writer tasks for `stream`.
    ///
    /// # Arguments
    ///
    /// * `stream` - The connected byte stream.
    /// * `address` - Peer address, used for logging.
    /// * `queue_size` - The maximum number of pending requests.
    pub fn new<S>(stream: S, address: impl Into<Arc<str>>, queue_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (request_tx, request_rx) = mpsc::channel(queue_size);
        let (waiter_tx, waiter_rx) = mpsc::channel(queue_size);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        // Either task exiting means the socket is unusable.
        let on_exit = Arc::clone(&closed);
        let writer_rx = closed_rx.clone();
        tokio::spawn(async move {
            run_writer(writer, request_rx, waiter_tx, writer_rx).await;
            on_exit.send_replace(true);
        });
        let on_exit = Arc::clone(&closed);
        tokio::spawn(async move {
            run_reader(reader, waiter_rx, closed_rx).await;
            on_exit.send_replace(true);
        });

        Self {
            address: address.into(),
            sender: request_tx,
            closed,
        }
    }

    /// Sends a batch of frames and awaits all replies.
    #[instrument(skip(self, frames), fields(address = %self.address, count = frames.len()), level = "debug")]
    pub async fn send(&self, frames: Vec<Frame>) -> Result<Vec<Frame>> {
        if *self.closed.borrow() {
            return Err(Error::closed());
        }
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(Request {
                frames,
                response_tx,
            })
            .await
            .map_err(|_| Error::closed())?;

        response_rx.await.map_err(|_| Error::closed())?
    }
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("address", &self.address)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl Connection for MultiplexedConnection {
    fn pipeline(&self, cmds: Vec<Cmd>) -> BoxFuture<'static, Result<Vec<Frame>>> {
        let this = self.clone();
        let frames = cmds.iter().map(Cmd::to_frame).collect();
        async move { this.send(frames).await }.boxed()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }
}

async fn run_writer<S>(
    mut writer: WriteHalf<S>,
    mut request_rx: mpsc::Receiver<Request>,
    waiter_tx: mpsc::Sender<Waiter>,
    mut closed: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut encoder = Encoder::new();
    loop {
        let req = tokio::select! {
            _ = closed.changed() => break,
            req = request_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        for frame in &req.frames {
            encoder.encode(frame);
        }
        let data = encoder.take();
        if let Err(e) = writer.write_all(&data).await {
            error!(error = ?e, "failed to write frames");
            let _ = req.response_tx.send(Err(Error::Io { source: e }));
            break;
        }

        let waiter = Waiter {
            expected: req.frames.len(),
            response_tx: req.response_tx,
        };
        if waiter_tx.send(waiter).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    // Requests still queued resolve as closed once `request_rx` drops.
}

async fn run_reader<S>(
    mut reader: ReadHalf<S>,
    mut waiter_rx: mpsc::Receiver<Waiter>,
    mut closed: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        // While idle, keep reading so a peer hangup is noticed at once.
        let next = tokio::select! {
            _ = closed.changed() => return,
            waiter = waiter_rx.recv() => Ok(waiter),
            read = reader.read(&mut buf) => Err(read),
        };
        let waiter = match next {
            Ok(Some(waiter)) => waiter,
            Ok(None) => return,
            Err(Ok(0)) => {
                debug!("peer closed idle connection");
                return;
            }
            Err(Ok(n)) => {
                decoder.append(&buf[..n]);
                continue;
            }
            Err(Err(e)) => {
                error!(error = ?e, "failed to read from socket");
                return;
            }
        };

        let mut replies = Vec::with_capacity(waiter.expected);
        while replies.len() < waiter.expected {
            match decoder.decode() {
                Ok(Some(frame)) => {
                    debug!(?frame, "received frame");
                    replies.push(frame);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "failed to decode frame");
                    let _ = waiter.response_tx.send(Err(e));
                    return;
                }
            }

            let read = tokio::select! {
                _ = closed.changed() => {
                    let _ = waiter.response_tx.send(Err(Error::closed()));
                    return;
                }
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    let _ = waiter.response_tx.send(Err(Error::closed()));
                    return;
                }
                Ok(n) => decoder.append(&buf[..n]),
                Err(e) => {
                    error!(error = ?e, "failed to read from socket");
                    let _ = waiter.response_tx.send(Err(Error::Io { source: e }));
                    return;
                }
            }
        }
        let _ = waiter.response_tx.send(Ok(replies));
    }
}

/// Opens [`MultiplexedConnection`]s over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    queue_size: usize,
}

impl TcpConnector {
    /// Creates a connector whose connections queue up to `queue_size` requests.
    pub fn new(queue_size: usize) -> Self {
        Self { queue_size }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Arc<dyn Connection>>> {
        let address = endpoint.address();
        let queue_size = self.queue_size;
        async move {
            let stream = TcpStream::connect(address.as_str()).await?;
            stream.set_nodelay(true)?;
            debug!(address = %address, "connected");
            let connection = MultiplexedConnection::new(stream, address, queue_size);
            Ok(Arc::new(connection) as Arc<dyn Connection>)
        }
        .boxed()
    }
}
