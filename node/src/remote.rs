use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    net::SocketAddr,
    sync::Arc,
};

use comms::{PeerClient, specs::PeerSpec, unresolvable};
use log::{debug, info, warn};
use parking_lot::Mutex;
use runtime::{
    Kwargs, Notify, Outcome, PipeError, QueueStats, RefId, RefTable, Resolver,
    StageHandle, Value, WorkKey,
};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Runs `fut` to completion from synchronous code.
///
/// Stage workers and the driver are plain threads, but a caller may also sit on
/// a multi threaded runtime worker, in which case the worker is handed over
/// to the blocking section first.
pub fn block_on<F: Future>(handle: &Handle, fut: F) -> F::Output {
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        _ => handle.block_on(fut),
    }
}

/// Lazily opened connections to every other process of the pipeline.
pub struct Peers {
    rank: usize,
    addrs: HashMap<usize, SocketAddr>,
    clients: Mutex<HashMap<usize, Arc<PeerClient>>>,
    handle: Handle,
}

impl Peers {
    /// Creates a new `Peers` registry.
    ///
    /// # Arguments
    /// * `rank` - The rank of this process, never connected to.
    /// * `peers` - Where the other processes listen.
    /// * `handle` - The runtime connections live on.
    pub fn new(rank: usize, peers: Vec<PeerSpec>, handle: Handle) -> Self {
        let addrs = peers
            .into_iter()
            .filter(|peer| peer.rank != rank)
            .map(|peer| (peer.rank, peer.addr))
            .collect();

        Self {
            rank,
            addrs,
            clients: Mutex::new(HashMap::new()),
            handle,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Registers an already open connection to `rank`.
    pub fn insert(&self, rank: usize, client: Arc<PeerClient>) {
        self.clients.lock().insert(rank, client);
    }

    /// Returns the connection to `rank`, opening it on first use.
    pub async fn client(&self, rank: usize) -> runtime::Result<Arc<PeerClient>> {
        let open = self.clients.lock().get(&rank).cloned();
        if let Some(client) = open {
            return Ok(client);
        }

        let Some(addr) = self.addrs.get(&rank) else {
            return Err(PipeError::Config(format!(
                "rank {} does not know where rank {rank} lives",
                self.rank
            )));
        };

        let client = Arc::new(PeerClient::connect(*addr).await?);
        info!("rank {} connected to rank {rank} at {addr}", self.rank);

        let mut clients = self.clients.lock();
        Ok(Arc::clone(clients.entry(rank).or_insert(client)))
    }
}

/// Resolves references owned by this process through the local table and
/// everything else by asking the owning peer.
pub struct PeerResolver {
    refs: Arc<RefTable>,
    peers: Arc<Peers>,
}

impl PeerResolver {
    pub fn new(refs: Arc<RefTable>, peers: Arc<Peers>) -> Self {
        Self { refs, peers }
    }

    fn is_local(&self, id: RefId) -> bool {
        id.rank == self.refs.rank()
    }
}

async fn fetch(peers: &Peers, id: RefId) -> Outcome {
    let client = peers
        .client(id.rank)
        .await
        .map_err(|e| unresolvable(id, e))?;

    client.fetch(id).await.map_err(|e| unresolvable(id, e))?
}

impl Resolver for PeerResolver {
    fn resolve(&self, id: RefId) -> Outcome {
        if self.is_local(id) {
            return self.refs.resolve(id);
        }

        debug!("rank {} fetching {id}", self.refs.rank());
        block_on(self.peers.handle(), fetch(&self.peers, id))
    }

    fn subscribe(&self, id: RefId, notify: Notify) {
        if self.is_local(id) {
            return self.refs.subscribe(id, notify);
        }

        let peers = Arc::clone(&self.peers);
        self.peers.handle().spawn(async move {
            notify(fetch(&peers, id).await);
        });
    }

    fn project(&self, id: RefId, index: usize) -> runtime::Result<RefId> {
        if self.is_local(id) {
            return self.refs.project_local(id, index);
        }

        block_on(self.peers.handle(), async {
            self.peers.client(id.rank).await?.project(id, index).await
        })
    }

    fn release(&self, ids: &[RefId]) {
        let mut by_rank: BTreeMap<usize, Vec<RefId>> = BTreeMap::new();
        for &id in ids {
            by_rank.entry(id.rank).or_default().push(id);
        }

        for (rank, ids) in by_rank {
            if rank == self.refs.rank() {
                self.refs.release(&ids);
                continue;
            }

            let released = block_on(self.peers.handle(), async {
                self.peers.client(rank).await?.release(ids).await
            });

            if let Err(e) = released {
                warn!("failed to release references on rank {rank}: {e}");
            }
        }
    }
}

/// A stage hosted by another process.
pub struct RemoteStage {
    name: String,
    rank: usize,
    client: Arc<PeerClient>,
    handle: Handle,
}

impl RemoteStage {
    /// Creates a new `RemoteStage`.
    ///
    /// # Arguments
    /// * `name` - The stage's name on its host.
    /// * `rank` - The host's rank.
    /// * `client` - The connection to the host.
    /// * `handle` - The runtime the connection lives on.
    pub fn new(
        name: impl Into<String>,
        rank: usize,
        client: Arc<PeerClient>,
        handle: Handle,
    ) -> Self {
        Self {
            name: name.into(),
            rank,
            client,
            handle,
        }
    }
}

impl StageHandle for RemoteStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn invoke(&self, args: Vec<Value>, kwargs: Kwargs, key: WorkKey) -> runtime::Result<RefId> {
        let id = block_on(&self.handle, self.client.invoke(&self.name, args, kwargs, key))?;
        debug!("invoked {key} on stage {} at rank {} as {id}", self.name, self.rank);
        Ok(id)
    }

    fn stats(&self) -> runtime::Result<QueueStats> {
        block_on(&self.handle, self.client.stats(&self.name))
    }
}
