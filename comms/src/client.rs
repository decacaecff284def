use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, warn};
use parking_lot::Mutex;
use runtime::{ExecError, Kwargs, Outcome, PipeError, QueueStats, RefId, Value, WorkKey};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinHandle,
};

use crate::{
    PipeReceiver, PipeSender,
    msg::{Command, Msg, RemoteError, Request, Response},
    specs::{PeerSpec, StageSpec},
};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;
type Writer = PipeSender<Box<dyn AsyncWrite + Send + Unpin>>;

/// One connection to a peer, shared by any number of concurrent callers.
///
/// Every request gets a fresh correlation id; a background task reads
/// responses and hands each one to the caller waiting on that id.
pub struct PeerClient {
    peer: String,
    next_id: AtomicU64,
    pending: Pending,
    tx: AsyncMutex<Writer>,
    reader: JoinHandle<()>,
}

impl PeerClient {
    /// Opens a TCP connection to `addr`.
    pub async fn connect<A>(addr: A) -> io::Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let peer = addr.to_string();
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        Ok(Self::new(peer, rx, tx))
    }

    /// Wraps an already open link. Must be called inside a tokio runtime.
    ///
    /// # Arguments
    /// * `peer` - A name for the peer, used in logs.
    /// * `rx` - The read half of the link.
    /// * `tx` - The write half of the link.
    pub fn new<R, W>(peer: impl Into<String>, rx: R, tx: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let (rx, tx) = crate::channel(rx, Box::new(tx) as Box<dyn AsyncWrite + Send + Unpin>);
        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_responses(peer.clone(), rx, Arc::clone(&pending)));

        Self {
            peer,
            next_id: AtomicU64::new(0),
            pending,
            tx: AsyncMutex::new(tx),
            reader,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends `body` and waits for the matching response.
    pub async fn call(&self, body: Request) -> io::Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().insert(id, done_tx);

        let msg = Msg::Request { id, body };
        if let Err(e) = self.tx.lock().await.send(&msg).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        done_rx.await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("connection to {} closed before request {id} was answered", self.peer),
            )
        })
    }

    /// Sends a control command, nothing answers it.
    pub async fn command(&self, cmd: Command) -> io::Result<()> {
        self.tx.lock().await.send(&Msg::Control(cmd)).await
    }

    /// Assigns the peer its rank and hands it the address of every other process.
    pub async fn join(
        &self,
        rank: usize,
        world_size: usize,
        peers: Vec<PeerSpec>,
    ) -> runtime::Result<()> {
        let req = Request::Join {
            rank,
            world_size,
            peers,
        };
        expect_ack(self.call(req).await?)
    }

    pub async fn create_stage(&self, name: &str, spec: StageSpec) -> runtime::Result<()> {
        let req = Request::CreateStage {
            name: name.to_string(),
            spec,
        };
        expect_ack(self.call(req).await?)
    }

    /// Queues a call of the remote stage `stage`.
    ///
    /// # Returns
    /// The reference to the result, owned by the peer.
    pub async fn invoke(
        &self,
        stage: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        key: WorkKey,
    ) -> runtime::Result<RefId> {
        let req = Request::Invoke {
            stage: stage.to_string(),
            args,
            kwargs,
            key,
        };

        match self.call(req).await? {
            Response::Submitted(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Waits until the peer has produced `id`.
    ///
    /// # Returns
    /// The slot's outcome, or a `PipeError` if the request itself failed.
    pub async fn fetch(&self, id: RefId) -> runtime::Result<Outcome> {
        match self.call(Request::Fetch { id }).await? {
            Response::Value(value) => Ok(Ok(value)),
            Response::Failed(RemoteError::Execution(e)) => Ok(Err(e)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn project(&self, id: RefId, index: usize) -> runtime::Result<RefId> {
        match self.call(Request::Project { id, index }).await? {
            Response::Submitted(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn release(&self, ids: Vec<RefId>) -> runtime::Result<()> {
        expect_ack(self.call(Request::Release { ids }).await?)
    }

    pub async fn stats(&self, stage: &str) -> runtime::Result<QueueStats> {
        let req = Request::Stats {
            stage: stage.to_string(),
        };

        match self.call(req).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn expect_ack(resp: Response) -> runtime::Result<()> {
    match resp {
        Response::Ack => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(resp: Response) -> PipeError {
    match resp {
        Response::Failed(e) => e.into(),
        other => PipeError::Remote(format!("unexpected response {other:?}")),
    }
}

/// Turns a failed request into the error stored for the reference it was about.
pub fn unresolvable(id: RefId, err: PipeError) -> ExecError {
    match err {
        PipeError::Execution(e) => e,
        other => ExecError::unresolvable(id, other),
    }
}

async fn read_responses<R>(peer: String, mut rx: PipeReceiver<R>, pending: Pending)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        match rx.recv_into(&mut buf).await {
            Ok(Msg::Response { id, body }) => {
                let done = pending.lock().remove(&id);
                match done {
                    Some(done) => {
                        let _ = done.send(body);
                    }
                    None => warn!("dropping response {id} from {peer}: nobody is waiting for it"),
                }
            }
            Ok(Msg::Err(e)) => warn!("{peer} reported an error: {e}"),
            Ok(other) => warn!("unexpected message from {peer}: {other:?}"),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("connection to {peer} closed");
                break;
            }
            Err(e) => {
                warn!("failed to read from {peer}: {e}");
                break;
            }
        }
    }

    pending.lock().clear();
}
