use std::{io, net::SocketAddr, sync::Arc};

use comms::{
    msg::{Command, Msg, RemoteError, Request, Response},
    specs::PeerSpec,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use runtime::{PipeError, RefTable, Resolver, RuntimeContext};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    runtime::Handle,
    sync::{Notify, mpsc, oneshot},
};

use crate::{
    builder::StageBuilder,
    remote::{PeerResolver, Peers},
};

type Replies = mpsc::UnboundedSender<(u64, Response)>;

/// Hosts stages and answers the pipeline protocol on a TCP port.
pub struct NodeServer {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl NodeServer {
    /// Binds a new `NodeServer` to `addr`.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(NodeState::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until a peer sends `Shutdown`, then tears down the
    /// node's runtime.
    pub async fn run(self) -> io::Result<()> {
        info!("listening at {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true)?;
                    info!("peer connected from {addr}");

                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = serve(state, stream).await {
                            warn!("connection with {addr} failed: {e}");
                        }
                        info!("peer {addr} disconnected");
                    });
                }
                _ = self.state.stopped.notified() => break,
            }
        }

        self.state.teardown().await;
        Ok(())
    }
}

#[derive(Default)]
struct NodeState {
    ctx: Mutex<Option<RuntimeContext>>,
    stopped: Notify,
}

impl NodeState {
    fn refs(&self) -> runtime::Result<Arc<RefTable>> {
        self.ctx
            .lock()
            .as_ref()
            .map(|ctx| Arc::clone(ctx.refs()))
            .ok_or_else(not_joined)
    }

    fn handle(&self, id: u64, req: Request, replies: &Replies) {
        if let Request::Fetch { id: ref_id } = req {
            return self.fetch(id, ref_id, replies);
        }

        let body = self.answer(req).unwrap_or_else(|e| {
            debug!("request {id} failed: {e}");
            Response::Failed(RemoteError::from(e))
        });
        let _ = replies.send((id, body));
    }

    fn answer(&self, req: Request) -> runtime::Result<Response> {
        match req {
            Request::Join {
                rank,
                world_size,
                peers,
            } => self.join(rank, world_size, peers),
            Request::CreateStage { name, spec } => {
                let stage = StageBuilder::build(spec)?;
                let mut ctx = self.ctx.lock();
                let ctx = ctx.as_mut().ok_or_else(not_joined)?;
                ctx.spawn_boxed(name, stage)?;
                Ok(Response::Ack)
            }
            Request::Invoke {
                stage,
                args,
                kwargs,
                key,
            } => {
                let stage = self.ctx.lock().as_ref().ok_or_else(not_joined)?.stage(&stage)?;
                Ok(Response::Submitted(stage.invoke(args, kwargs, key)?))
            }
            Request::Project { id, index } => {
                Ok(Response::Submitted(self.refs()?.project_local(id, index)?))
            }
            Request::Release { ids } => {
                self.refs()?.release(&ids);
                Ok(Response::Ack)
            }
            Request::Stats { stage } => {
                let stage = self.ctx.lock().as_ref().ok_or_else(not_joined)?.stage(&stage)?;
                Ok(Response::Stats(stage.stats()?))
            }
            Request::Fetch { id } => Err(PipeError::Remote(format!(
                "fetch of {id} must not be answered inline"
            ))),
        }
    }

    fn join(&self, rank: usize, world_size: usize, peers: Vec<PeerSpec>) -> runtime::Result<Response> {
        let mut ctx = self.ctx.lock();
        if let Some(ctx) = ctx.as_ref() {
            return Err(PipeError::Config(format!(
                "node already joined as rank {}",
                ctx.local_rank()
            )));
        }

        let refs = Arc::new(RefTable::new(rank));
        let peers = Arc::new(Peers::new(rank, peers, Handle::current()));
        let resolver: Arc<dyn Resolver> = Arc::new(PeerResolver::new(Arc::clone(&refs), peers));

        *ctx = Some(RuntimeContext::with_resolver(rank, world_size, refs, resolver));
        info!("joined the pipeline as rank {rank} of {world_size}");
        Ok(Response::Ack)
    }

    /// Answers once the slot is set, without holding up the connection.
    fn fetch(&self, id: u64, ref_id: runtime::RefId, replies: &Replies) {
        let slot = match self.refs() {
            Ok(refs) => refs.slot(ref_id).ok_or(PipeError::UnknownRef(ref_id)),
            Err(e) => Err(e),
        };

        let slot = match slot {
            Ok(slot) => slot,
            Err(e) => {
                let _ = replies.send((id, Response::Failed(e.into())));
                return;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        slot.subscribe(Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        }));

        let replies = replies.clone();
        tokio::spawn(async move {
            let body = match done_rx.await {
                Ok(Ok(value)) => Response::Value(value),
                Ok(Err(e)) => Response::Failed(RemoteError::Execution(e)),
                Err(_) => Response::Failed(RemoteError::Other(format!(
                    "slot {ref_id} was dropped before it was set"
                ))),
            };
            let _ = replies.send((id, body));
        });
    }

    async fn teardown(&self) {
        let ctx = self.ctx.lock().take();
        if let Some(ctx) = ctx {
            let torn_down = tokio::task::spawn_blocking(move || ctx.teardown()).await;
            if let Err(e) = torn_down {
                warn!("runtime teardown panicked: {e}");
            }
        }
    }
}

fn not_joined() -> PipeError {
    PipeError::Config("node has not joined a pipeline yet".into())
}

async fn serve(state: Arc<NodeState>, stream: TcpStream) -> io::Result<()> {
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);

    let (replies, mut outbox) = mpsc::unbounded_channel::<(u64, Response)>();
    let writer = tokio::spawn(async move {
        while let Some((id, body)) = outbox.recv().await {
            tx.send(&Msg::Response { id, body }).await?;
        }
        tx.shutdown().await
    });

    let mut buf = Vec::new();
    loop {
        let msg = match rx.recv_into(&mut buf).await {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                drop(replies);
                let _ = writer.await;
                return Err(e);
            }
        };

        match msg {
            Msg::Request { id, body } => state.handle(id, body, &replies),
            Msg::Control(Command::Disconnect) => break,
            Msg::Control(Command::Shutdown) => {
                info!("received shutdown");
                state.stopped.notify_one();
                break;
            }
            Msg::Err(e) => warn!("peer reported an error: {e}"),
            Msg::Response { id, .. } => warn!("unexpected response {id} on a serving connection"),
        }
    }

    drop(replies);
    match writer.await {
        Ok(written) => written,
        Err(e) => Err(io::Error::other(e)),
    }
}
