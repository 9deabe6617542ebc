use std::any::Any;
use std::fs::File;
use std::io::{BufReader, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use protobuf::Message;
use rayon::ThreadPool;

use super::limiter::TaskLimiter;
use crate::codecs::blob::{decode_blob_payload, BlobReader};
use crate::codecs::block_decorators::{HeaderReader, PrimitiveReader};
use crate::error::{PbfError, Result};
use crate::models::{BoundBox, Header, Node, Relation, Way};
use crate::proto::osmformat;

const TYPE_OSM_HEADER: &str = "OSMHeader";
const TYPE_OSM_DATA: &str = "OSMData";

type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;
type CompletionSink = Arc<dyn Fn() + Send + Sync>;

/// Sink callbacks, any subset of which may be configured. Entity sinks run
/// on worker threads and must be reentrant and thread safe; an absent sink
/// disables the corresponding decode work.
#[derive(Clone, Default)]
struct Sinks {
    nodes: Option<Sink<Node>>,
    ways: Option<Sink<Way>>,
    relations: Option<Sink<Relation>>,
    changesets: Option<Sink<i64>>,
    header: Option<Sink<Header>>,
    bound_box: Option<Sink<BoundBox>>,
}

impl Sinks {
    fn wants_data(&self) -> bool {
        self.nodes.is_some()
            || self.ways.is_some()
            || self.relations.is_some()
            || self.changesets.is_some()
    }
}

/// First-failure slot shared between the reader thread and the workers.
/// Recording a failure also raises the cancellation flag, so queued tasks
/// bail out before decoding.
#[derive(Default)]
struct FailureFlag {
    cancelled: AtomicBool,
    error: Mutex<Option<PbfError>>,
}

impl FailureFlag {
    fn record(&self, err: PbfError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<PbfError> {
        self.error.lock().unwrap().take()
    }
}

#[derive(Clone, Copy)]
enum BlobKind {
    Header,
    Data,
}

/// Parallel OSM PBF parser.
///
/// The input stream is read sequentially on the calling thread while blobs
/// are decoded concurrently on a bounded worker pool; parsed entities are
/// delivered to the configured sinks. Between blocks no delivery order is
/// guaranteed when more than one worker is configured; within one block,
/// entities of one kind arrive in file order. The header sink is served
/// before any entity sink and the completion callback strictly after all of
/// them.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
///
/// use pbf_parallel::readers::ParallelReader;
///
/// let nodes = Arc::new(AtomicU64::new(0));
/// let counter = Arc::clone(&nodes);
/// let reader = ParallelReader::from_path("planet.osm.pbf", 4)
///     .unwrap()
///     .on_node(move |_| {
///         counter.fetch_add(1, Ordering::Relaxed);
///     });
/// reader.parse().unwrap();
/// println!("{} nodes", nodes.load(Ordering::Relaxed));
/// ```
pub struct ParallelReader<R: Read + Send> {
    reader: Mutex<BlobReader<R>>,
    threads: usize,
    partitions: u64,
    shard: u64,
    sinks: Sinks,
    on_complete: Option<CompletionSink>,
}

impl<R: Read + Send> ParallelReader<R> {
    /// Parser over the whole stream with `threads` decode workers.
    pub fn new(reader: R, threads: usize) -> Self {
        Self::new_sharded(reader, threads, 1, 0)
    }

    /// Parser owning one shard of a partitioned stream: of the `OSMData`
    /// blobs, only those whose running index is congruent to `shard` modulo
    /// `partitions` are decoded, the rest are skipped without buffering.
    /// The union of all shards covers the stream exactly once.
    pub fn new_sharded(reader: R, threads: usize, partitions: u64, shard: u64) -> Self {
        assert!(threads >= 1, "at least one worker thread is required");
        assert!(partitions >= 1, "at least one partition is required");
        assert!(shard < partitions, "shard must be less than partitions");
        Self {
            reader: Mutex::new(BlobReader::new(reader)),
            threads,
            partitions,
            shard,
            sinks: Sinks::default(),
            on_complete: None,
        }
    }

    pub fn on_node<F>(mut self, callback: F) -> Self
    where
        F: Fn(Node) + Send + Sync + 'static,
    {
        self.sinks.nodes = Some(Arc::new(callback));
        self
    }

    pub fn on_way<F>(mut self, callback: F) -> Self
    where
        F: Fn(Way) + Send + Sync + 'static,
    {
        self.sinks.ways = Some(Arc::new(callback));
        self
    }

    pub fn on_relation<F>(mut self, callback: F) -> Self
    where
        F: Fn(Relation) + Send + Sync + 'static,
    {
        self.sinks.relations = Some(Arc::new(callback));
        self
    }

    pub fn on_changeset<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.sinks.changesets = Some(Arc::new(callback));
        self
    }

    pub fn on_header<F>(mut self, callback: F) -> Self
    where
        F: Fn(Header) + Send + Sync + 'static,
    {
        self.sinks.header = Some(Arc::new(callback));
        self
    }

    /// The bounding box sink. Without it the header's bounding box is not
    /// decoded at all.
    pub fn on_bound_box<F>(mut self, callback: F) -> Self
    where
        F: Fn(BoundBox) + Send + Sync + 'static,
    {
        self.sinks.bound_box = Some(Arc::new(callback));
        self
    }

    /// Called exactly once after every other callback when parsing
    /// succeeds; suppressed on failure.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Parses the stream, blocking until every blob is handled.
    ///
    /// Returns [`PbfError::ParserBusy`] when invoked while another `parse`
    /// call on the same instance is still running. On a worker failure the
    /// remaining queued tasks are cancelled, the first failure is returned
    /// and the completion callback does not run.
    pub fn parse(&self) -> Result<()> {
        let mut reader = self.reader.try_lock().map_err(|_| PbfError::ParserBusy)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|err| {
                PbfError::WorkerFailed(format!("failed to build worker pool: {}", err))
            })?;
        let limiter = Arc::new(TaskLimiter::new(self.threads));
        let failure = Arc::new(FailureFlag::default());

        let outcome = self.read_loop(&mut reader, &pool, &limiter, &failure);
        limiter.wait_idle();

        if let Some(err) = failure.take() {
            log::error!("parsing failed: {}", err);
            return Err(err);
        }
        outcome?;

        if let Some(on_complete) = &self.on_complete {
            on_complete();
        }
        Ok(())
    }

    fn read_loop(
        &self,
        reader: &mut BlobReader<R>,
        pool: &ThreadPool,
        limiter: &Arc<TaskLimiter>,
        failure: &Arc<FailureFlag>,
    ) -> Result<()> {
        let sinks = Arc::new(self.sinks.clone());
        let mut current_data_block: u64 = 0;
        let mut header_seen = false;

        while !failure.is_cancelled() {
            let info = match reader.next_header()? {
                Some(info) => info,
                None => break,
            };
            match info.blob_type.as_str() {
                TYPE_OSM_HEADER => {
                    let payload = reader.read_payload(info.datasize)?;
                    header_seen = true;
                    submit(pool, limiter, failure, &sinks, BlobKind::Header, payload);
                }
                TYPE_OSM_DATA => {
                    if !sinks.wants_data() && header_seen {
                        // Nothing downstream consumes entities; the header
                        // is already queued, so the run is complete.
                        break;
                    }
                    if !header_seen {
                        log::error!("Got OSMData before OSMHeader, skipping the blob");
                        reader.skip_payload(info.datasize)?;
                        current_data_block += 1;
                        continue;
                    }
                    let shard = current_data_block % self.partitions;
                    log::trace!(
                        "data block {}: shard {}, own shard {}",
                        current_data_block,
                        shard,
                        self.shard
                    );
                    current_data_block += 1;
                    if shard != self.shard {
                        reader.skip_payload(info.datasize)?;
                        continue;
                    }
                    let payload = reader.read_payload(info.datasize)?;
                    submit(pool, limiter, failure, &sinks, BlobKind::Data, payload);
                }
                other => {
                    log::warn!("skipping blob of unknown type {:?}", other);
                    reader.skip_payload(info.datasize)?;
                }
            }
        }
        Ok(())
    }
}

impl ParallelReader<BufReader<File>> {
    pub fn from_path<P: AsRef<Path>>(path: P, threads: usize) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), threads))
    }

    pub fn from_path_sharded<P: AsRef<Path>>(
        path: P,
        threads: usize,
        partitions: u64,
        shard: u64,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new_sharded(BufReader::new(file), threads, partitions, shard))
    }
}

/// Acquires a slot, blocking while the pool is saturated, then hands the
/// blob to a worker. The slot is released by the worker on every path.
fn submit(
    pool: &ThreadPool,
    limiter: &Arc<TaskLimiter>,
    failure: &Arc<FailureFlag>,
    sinks: &Arc<Sinks>,
    kind: BlobKind,
    payload: Vec<u8>,
) {
    limiter.acquire();
    let limiter = Arc::clone(limiter);
    let failure = Arc::clone(failure);
    let sinks = Arc::clone(sinks);
    pool.spawn(move || {
        if !failure.is_cancelled() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
                BlobKind::Header => process_header_blob(&payload, &sinks),
                BlobKind::Data => process_data_blob(&payload, &sinks),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failure.record(err),
                Err(panic) => failure.record(PbfError::WorkerFailed(format!(
                    "sink callback panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        }
        limiter.release();
    });
}

fn process_header_blob(payload: &[u8], sinks: &Sinks) -> Result<()> {
    let bytes = decode_blob_payload(payload)?;
    let block: osmformat::HeaderBlock = Message::parse_from_bytes(&bytes)
        .map_err(|err| PbfError::MalformedBlock(format!("invalid header block: {}", err)))?;

    let header = HeaderReader::new(block).read(sinks.bound_box.is_some());
    if let Some(on_bound_box) = &sinks.bound_box {
        if let Some(bbox) = header.bbox {
            on_bound_box(bbox);
        }
    }
    if let Some(on_header) = &sinks.header {
        on_header(header);
    }
    Ok(())
}

fn process_data_blob(payload: &[u8], sinks: &Sinks) -> Result<()> {
    let bytes = decode_blob_payload(payload)?;
    if bytes.is_empty() {
        return Ok(());
    }
    let block: osmformat::PrimitiveBlock = Message::parse_from_bytes(&bytes)
        .map_err(|err| PbfError::MalformedBlock(format!("invalid primitive block: {}", err)))?;

    let reader = PrimitiveReader::new(block);
    for group in reader.block().get_primitivegroup() {
        if let Some(on_node) = &sinks.nodes {
            if group.has_dense() {
                reader.process_dense(group.get_dense(), |node| on_node(node))?;
            }
            reader.process_nodes(group.get_nodes(), |node| on_node(node))?;
        }
        if let Some(on_way) = &sinks.ways {
            reader.process_ways(group.get_ways(), |way| on_way(way))?;
        }
        if let Some(on_relation) = &sinks.relations {
            reader.process_relations(group.get_relations(), |relation| on_relation(relation))?;
        }
        if let Some(on_changeset) = &sinks.changesets {
            reader.process_changesets(group.get_changesets(), |id| on_changeset(id));
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
