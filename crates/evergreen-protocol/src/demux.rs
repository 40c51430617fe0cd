//! Inbound tree reconstruction.
//!
//! The peer sends each output as a tree of [`NodeFragment`]s. A node lists
//! child ids; leaves carry chunks. Fragments may arrive in any order across
//! ids, so a fragment whose id has not been claimed by any output yet is
//! parked in a pending buffer and replayed once an ancestor declares it.
//!
//! An output closes once every id mapped to it has sent `continued: false`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use evergreen_core::{ChunkSummary, InvocationId, MimetypeCodec, Pipe, StreamId, StreamItem};
use evergreen_telemetry::MetricsRecorder;
use evergreen_transport::{decode_chunk, NodeFragment, SessionMessage, WireChunk};

struct OutputState {
    pipe: Pipe,
    mapped: HashSet<StreamId>,
    finished: HashSet<StreamId>,
    done: bool,
}

impl OutputState {
    fn is_complete(&self) -> bool {
        self.mapped.iter().all(|id| self.finished.contains(id))
    }
}

pub struct Demux {
    invocation_id: InvocationId,
    outputs: BTreeMap<String, OutputState>,
    mapping: HashMap<StreamId, String>,
    pending: HashMap<StreamId, Vec<NodeFragment>>,
    pending_order: VecDeque<StreamId>,
    pending_len: usize,
    max_pending: usize,
    last_seq: HashMap<StreamId, u64>,
    codec: Arc<dyn MimetypeCodec>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Demux {
    pub fn new(
        invocation_id: InvocationId,
        max_pending: usize,
        codec: Arc<dyn MimetypeCodec>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            invocation_id,
            outputs: BTreeMap::new(),
            mapping: HashMap::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            pending_len: 0,
            max_pending,
            last_seq: HashMap::new(),
            codec,
            metrics,
        }
    }

    /// Claim `id` as the root of output `name`.
    pub fn add_output(&mut self, name: impl Into<String>, id: StreamId, pipe: Pipe) {
        let name = name.into();
        self.mapping.insert(id.clone(), name.clone());
        self.outputs.insert(
            name,
            OutputState {
                pipe,
                mapped: HashSet::from([id]),
                finished: HashSet::new(),
                done: false,
            },
        );
    }

    pub fn handle_message(&mut self, message: &SessionMessage) {
        if self.is_complete() {
            return;
        }
        for fragment in &message.node_fragments {
            self.accept(fragment.clone());
        }
    }

    /// True once every output has closed or failed.
    pub fn is_complete(&self) -> bool {
        self.outputs.values().all(|output| output.done)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub fn output_for(&self, id: &StreamId) -> Option<&str> {
        self.mapping.get(id).map(String::as_str)
    }

    fn accept(&mut self, fragment: NodeFragment) {
        let Some(id) = fragment.id.clone() else {
            tracing::warn!(invocation_id = %self.invocation_id, "Fragment without id, skipping");
            return;
        };
        self.count("evergreen.fragments_received", 1);
        self.route(id, fragment);
    }

    /// Seq tracking only covers ids mapped to an output; parked fragments are
    /// checked when replayed.
    fn advance_seq(&mut self, id: &StreamId, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        if let Some(&last) = self.last_seq.get(id) {
            if seq <= last {
                tracing::warn!(
                    invocation_id = %self.invocation_id,
                    stream_id = %id,
                    seq,
                    last,
                    "Dropping replayed fragment"
                );
                self.count("evergreen.fragments_dropped", 1);
                return false;
            }
        }
        self.last_seq.insert(id.clone(), seq);
        true
    }

    fn route(&mut self, id: StreamId, fragment: NodeFragment) {
        let Some(output) = self.mapping.get(&id).cloned() else {
            self.park(id, fragment);
            return;
        };
        if !self.advance_seq(&id, fragment.seq) {
            return;
        }

        if let Some(children) = &fragment.child_ids {
            for child in children {
                self.mapping.insert(child.clone(), output.clone());
                if let Some(state) = self.outputs.get_mut(&output) {
                    state.mapped.insert(child.clone());
                }
                if let Some(buffered) = self.unpark(child) {
                    tracing::debug!(
                        invocation_id = %self.invocation_id,
                        stream_id = %child,
                        count = buffered.len(),
                        "Replaying pending fragments"
                    );
                    for parked in buffered {
                        self.route(child.clone(), parked);
                    }
                }
            }
        } else if let Some(wire) = fragment.chunk_fragment.clone() {
            self.deliver(&output, &id, wire);
        }

        if !fragment.continued {
            self.finish(&output, id);
        }
    }

    fn deliver(&mut self, output: &str, id: &StreamId, wire: WireChunk) {
        let Some(state) = self.outputs.get_mut(output) else {
            return;
        };
        if state.done {
            return;
        }
        match decode_chunk(wire, self.codec.as_ref()) {
            Ok(Some(chunk)) => {
                tracing::trace!(output, stream_id = %id, chunk = ?ChunkSummary::from(&chunk), "Chunk delivered");
                if let Err(e) = state.pipe.write(StreamItem::Leaf(chunk)) {
                    tracing::debug!(output, stream_id = %id, error = %e, "Output rejected chunk");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    invocation_id = %self.invocation_id,
                    output,
                    stream_id = %id,
                    error = %e,
                    "Undecodable chunk, failing output"
                );
                state.pipe.error(e);
                state.done = true;
                self.count("evergreen.decode_errors", 1);
            }
        }
    }

    fn finish(&mut self, output: &str, id: StreamId) {
        let Some(state) = self.outputs.get_mut(output) else {
            return;
        };
        state.finished.insert(id);
        if state.done || !state.is_complete() {
            return;
        }
        state.done = true;
        match state.pipe.close() {
            Ok(()) => tracing::debug!(invocation_id = %self.invocation_id, output, "Output complete"),
            Err(e) => tracing::debug!(output, error = %e, "Output already terminated"),
        }
    }

    fn park(&mut self, id: StreamId, fragment: NodeFragment) {
        let buffer = self.pending.entry(id.clone()).or_default();
        if buffer.is_empty() {
            self.pending_order.push_back(id.clone());
        }
        buffer.push(fragment);
        self.pending_len += 1;
        self.count("evergreen.fragments_buffered", 1);
        tracing::trace!(invocation_id = %self.invocation_id, stream_id = %id, "Fragment pending");

        while self.pending_len > self.max_pending {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.pending.remove(&oldest) {
                self.pending_len -= evicted.len();
                tracing::warn!(
                    invocation_id = %self.invocation_id,
                    stream_id = %oldest,
                    count = evicted.len(),
                    "Pending buffer full, evicting oldest id"
                );
                self.count("evergreen.fragments_evicted", evicted.len() as u64);
            }
        }
        self.gauge_pending();
    }

    fn unpark(&mut self, id: &StreamId) -> Option<Vec<NodeFragment>> {
        let buffered = self.pending.remove(id)?;
        self.pending_order.retain(|queued| queued != id);
        self.pending_len -= buffered.len();
        self.gauge_pending();
        Some(buffered)
    }

    fn count(&self, name: &str, n: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, n);
        }
    }

    fn gauge_pending(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge("evergreen.pending_fragments", self.pending_len as i64);
        }
    }
}
