//! Block oracle.
//!
//! Serves raw blocks as shared futures: a request hits the bounded cache,
//! then the on-disk store, and otherwise waits for the download pipeline or
//! an externally submitted block to resolve it. The sequential block
//! downloader only runs when the storage policy retains all blocks, which
//! mirrors how the store itself is gated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::actor::{self, Actor, Handle};
use crate::crypto;
use crate::database::Database;
use crate::download::{Batch, DownloadManager, DownloadSink, HeaderSource};
use crate::events::{Event, EventBus};
use crate::types::{BlockHash, Chain, Position, StoragePolicy};

/// Capacity of the in-memory future cache.
const BLOCK_CACHE_LIMIT: usize = 100;

/// Download-pipeline cadence.
const HEARTBEAT: Duration = Duration::from_millis(500);

/// A shared, cancellable handle to a block that may still be in flight.
/// Dropping every clone of a pending future abandons the request.
pub type BlockFuture = Shared<BoxFuture<'static, Option<Arc<Vec<u8>>>>>;

/// Validates a downloaded block beyond its header hash, e.g. by checking
/// the merkle root against the stored header.
pub trait BlockValidator: Send + Sync {
    fn validate(&self, position: &Position, raw: &[u8]) -> bool;
}

/// Validator that accepts any block whose hash already matched.
pub struct AcceptAllValidator;

impl BlockValidator for AcceptAllValidator {
    fn validate(&self, _position: &Position, _raw: &[u8]) -> bool {
        true
    }
}

fn ready_future(bytes: Arc<Vec<u8>>) -> BlockFuture {
    futures::future::ready(Some(bytes)).boxed().shared()
}

fn pending_future(rx: oneshot::Receiver<Arc<Vec<u8>>>) -> BlockFuture {
    rx.map(|r| r.ok()).boxed().shared()
}

/// Bounded LRU of block futures plus the resolvers of pending entries.
struct BlockCache {
    limit: usize,
    order: VecDeque<BlockHash>,
    futures: HashMap<BlockHash, BlockFuture>,
    pending: HashMap<BlockHash, oneshot::Sender<Arc<Vec<u8>>>>,
}

impl BlockCache {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            futures: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn find(&self, hash: &BlockHash) -> Option<BlockFuture> {
        self.futures.get(hash).cloned()
    }

    fn push(&mut self, hash: BlockHash, future: BlockFuture) {
        if self.futures.insert(hash, future).is_none() {
            self.order.push_back(hash);
        }

        while self.order.len() > self.limit {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            // Dropping the future cancels any request still waiting on it.
            self.futures.remove(&evicted);
            self.pending.remove(&evicted);
            trace!("evicted {evicted} from block cache");
        }
    }

    fn resolve(&mut self, hash: &BlockHash, bytes: Arc<Vec<u8>>) -> bool {
        match self.pending.remove(hash) {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.futures.clear();
        self.pending.clear();
    }
}

/// Messages accepted by the block oracle actor.
pub enum BlockWork {
    /// The header chain advanced (or reorganized) to this position.
    UpdatePosition(Position),
    /// Raw block bytes obtained from any source.
    Submit(Vec<u8>),
    /// A worker finished downloading the block for `position`.
    Downloaded { position: Position, raw: Vec<u8> },
    /// Hand out the next download batch.
    GetBatch(oneshot::Sender<Option<Batch>>),
}

struct BlockSink {
    db: Arc<Database>,
    chain: Chain,
    cache: Arc<Mutex<BlockCache>>,
    validator: Arc<dyn BlockValidator>,
    events: EventBus,
}

impl BlockSink {
    fn persist(&self, position: &Position, raw: &[u8]) -> bool {
        if self.db.block_policy() != StoragePolicy::All {
            return true;
        }
        if self.db.blocks.exists(&position.hash) {
            return true;
        }
        match self.db.blocks.store(&position.hash, raw.len() as u64) {
            Some(mut writer) => {
                writer.copy_from_slice(raw);
                true
            }
            None => false,
        }
    }
}

impl DownloadSink for BlockSink {
    type Payload = Vec<u8>;
    type Anchor = ();

    fn verify(&self, position: &Position, raw: &Vec<u8>) -> bool {
        if raw.len() < 80 {
            warn!("block for {position} is shorter than a header");
            return false;
        }
        let hash = BlockHash(crypto::sha256d(&raw[..80]));
        if hash != position.hash {
            error!(
                "block hash mismatch at height {}: received {hash} expected {}",
                position.height, position.hash
            );
            return false;
        }
        self.validator.validate(position, raw)
    }

    fn advance(&self, _position: &Position, _raw: &Vec<u8>, _previous: &()) {}

    fn commit(&mut self, position: &Position, raw: &Vec<u8>, _anchor: &()) -> bool {
        if !self.persist(position, raw) {
            return false;
        }

        let bytes = Arc::new(raw.clone());
        let mut cache = self.cache.lock();
        cache.resolve(&position.hash, bytes.clone());
        cache.push(position.hash, ready_future(bytes));
        drop(cache);

        self.events.publish(Event::NewBlock {
            chain: self.chain,
            position: *position,
        });
        true
    }
}

struct BlockOracleActor {
    manager: DownloadManager<BlockSink>,
    headers: Arc<dyn HeaderSource + Send + Sync>,
    download_enabled: bool,
    cache: Arc<Mutex<BlockCache>>,
}

impl Actor for BlockOracleActor {
    type Work = BlockWork;

    fn pipeline(&mut self, work: BlockWork) {
        match work {
            BlockWork::UpdatePosition(target) => {
                if self.download_enabled {
                    let before = self.manager.known();
                    self.manager
                        .update_position(target, self.headers.as_ref(), |_| Some(()));

                    let after = self.manager.known();
                    if after.height < before.height {
                        let sink = self.manager.sink();
                        sink.events.publish(Event::ReorgBlock {
                            chain: sink.chain,
                            ancestor: after,
                        });
                    }
                }
            }
            BlockWork::Submit(raw) => {
                if raw.len() < 80 {
                    warn!("discarding undersized submitted block");
                    return;
                }
                let hash = BlockHash(crypto::sha256d(&raw[..80]));
                match self.manager.find_position(&hash) {
                    Some(position) => {
                        self.manager.receive(&position, raw);
                    }
                    None => {
                        // Not part of the queue: resolve waiting requests
                        // directly.
                        let bytes = Arc::new(raw);
                        let mut cache = self.cache.lock();
                        let resolved = cache.resolve(&hash, bytes.clone());
                        if resolved {
                            cache.push(hash, ready_future(bytes));
                            debug!("submitted block {hash} resolved a pending request");
                        }
                    }
                }
            }
            BlockWork::Downloaded { position, raw } => {
                self.manager.receive(&position, raw);
            }
            BlockWork::GetBatch(reply) => {
                let batch = if self.download_enabled {
                    self.manager.allocate_batch()
                } else {
                    None
                };
                let _ = reply.send(batch);
            }
        }
    }

    fn state_machine(&mut self) -> bool {
        self.manager.heartbeat();
        false
    }

    fn shut_down(&mut self) {
        self.cache.lock().clear();
    }
}

/// Owner handle to a running block oracle.
pub struct BlockOracle {
    db: Arc<Database>,
    chain: Chain,
    cache: Arc<Mutex<BlockCache>>,
    handle: Handle<BlockWork>,
    download_enabled: bool,
}

impl BlockOracle {
    /// Spawns the oracle. The sequential downloader is enabled only when
    /// the database retains every block.
    pub fn start(
        db: Arc<Database>,
        chain: Chain,
        headers: Arc<dyn HeaderSource + Send + Sync>,
        validator: Arc<dyn BlockValidator>,
        events: EventBus,
        start: Position,
    ) -> Self {
        let cache = Arc::new(Mutex::new(BlockCache::new(BLOCK_CACHE_LIMIT)));
        let download_enabled = db.block_policy() == StoragePolicy::All;

        let sink = BlockSink {
            db: db.clone(),
            chain,
            cache: cache.clone(),
            validator,
            events,
        };
        let actor = BlockOracleActor {
            manager: DownloadManager::new(sink, start, ()),
            headers,
            download_enabled,
            cache: cache.clone(),
        };

        Self {
            db,
            chain,
            cache,
            handle: actor::spawn(actor, HEARTBEAT),
            download_enabled,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Requests one block. The returned future resolves when the block is
    /// available locally, arrives from a worker, or is submitted; it
    /// resolves to `None` if the request is evicted or the oracle shuts
    /// down first.
    pub fn load_bitcoin(&self, hash: &BlockHash) -> BlockFuture {
        let mut cache = self.cache.lock();
        if let Some(future) = cache.find(hash) {
            return future;
        }

        if let Some(reader) = self.db.blocks.load(hash) {
            let future = ready_future(Arc::new(reader.to_vec()));
            cache.push(*hash, future.clone());
            return future;
        }

        let (tx, rx) = oneshot::channel();
        let future = pending_future(rx);
        cache.pending.insert(*hash, tx);
        cache.push(*hash, future.clone());
        trace!("block {hash} queued for arrival");
        future
    }

    /// Pointwise variant of [`BlockOracle::load_bitcoin`]; the result has
    /// the same length as the input.
    pub fn load_bitcoin_many(&self, hashes: &[BlockHash]) -> Vec<BlockFuture> {
        hashes.iter().map(|hash| self.load_bitcoin(hash)).collect()
    }

    /// Feeds externally obtained block bytes into the pipeline.
    pub async fn submit_block(&self, raw: Vec<u8>) -> bool {
        self.handle.mailbox().send(BlockWork::Submit(raw)).await
    }

    /// Reports a new header tip to the sequential downloader.
    pub async fn update_position(&self, position: Position) -> bool {
        self.handle
            .mailbox()
            .send(BlockWork::UpdatePosition(position))
            .await
    }

    /// Delivers a block downloaded by an external worker.
    pub async fn submit_download(&self, position: Position, raw: Vec<u8>) -> bool {
        self.handle
            .mailbox()
            .send(BlockWork::Downloaded { position, raw })
            .await
    }

    /// Next batch of positions for an external worker, when downloads are
    /// enabled.
    pub async fn get_block_job(&self) -> Option<Batch> {
        if !self.download_enabled {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        if !self.handle.mailbox().send(BlockWork::GetBatch(tx)).await {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn shutdown(&mut self) {
        self.handle.shutdown().await;
    }
}
