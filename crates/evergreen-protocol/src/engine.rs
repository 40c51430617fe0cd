//! The Evergreen protocol engine.
//!
//! One [`Evergreen::invoke`] call sends a single Action envelope naming the
//! wire ids of every input and output, then streams each input pipe as
//! sequenced leaf fragments while a [`Demux`] routes inbound fragments into
//! the output pipes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use evergreen_core::{
    BasicMimetypeCodec, ChunkSummary, InvocationId, MimetypeCodec, Pipe, SessionId, StreamId,
};
use evergreen_telemetry::MetricsRecorder;
use evergreen_transport::{
    encode_chunk, Action, ConnectionCache, ConnectionManager, NamedId, NodeFragment,
    SessionMessage, TargetSpec, TransportFactory,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EvergreenConfig;
use crate::demux::Demux;
use crate::error::EvergreenError;

/// One remote action call: where to send it and which pipes it binds.
#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub session_id: SessionId,
    /// Falls back to [`EvergreenConfig::address`].
    pub address: Option<String>,
    pub target: String,
    pub name: String,
    pub inputs: Vec<(String, Pipe)>,
    pub outputs: Vec<(String, Pipe)>,
    pub configs: Vec<serde_json::Value>,
}

impl ActionRequest {
    pub fn new(session_id: SessionId, target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session_id,
            address: None,
            target: target.into(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            configs: Vec::new(),
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, pipe: Pipe) -> Self {
        self.inputs.push((name.into(), pipe));
        self
    }

    pub fn output(mut self, name: impl Into<String>, pipe: Pipe) -> Self {
        self.outputs.push((name.into(), pipe));
        self
    }

    pub fn config(mut self, value: serde_json::Value) -> Self {
        self.configs.push(value);
        self
    }

    fn check_unique(&self) -> Result<(), EvergreenError> {
        for (direction, fields) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = HashSet::new();
            for (name, _) in fields {
                if !seen.insert(name.as_str()) {
                    return Err(EvergreenError::DuplicateField {
                        direction,
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Client side of the protocol. Cheap to share behind an `Arc`.
pub struct Evergreen {
    config: EvergreenConfig,
    cache: Arc<ConnectionCache>,
    codec: Arc<dyn MimetypeCodec>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Evergreen {
    pub fn new(config: EvergreenConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_cache(config, Arc::new(ConnectionCache::new(factory)))
    }

    pub fn with_cache(config: EvergreenConfig, cache: Arc<ConnectionCache>) -> Self {
        Self {
            config,
            cache,
            codec: Arc::new(BasicMimetypeCodec),
            metrics: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MimetypeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EvergreenConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Start a remote action and wire its pipes.
    ///
    /// Returns once the Action envelope is sent. Inputs keep streaming in the
    /// background; outputs fill as fragments arrive.
    pub async fn invoke(&self, request: ActionRequest) -> Result<Invocation, EvergreenError> {
        request.check_unique()?;
        let invocation_id = InvocationId::new();
        let address = request
            .address
            .clone()
            .unwrap_or_else(|| self.config.address.clone());

        let manager = self.cache.get_connection(&request.session_id, &address);
        manager
            .connect_with_timeout(self.config.connect_timeout())
            .await?;

        let input_ids: BTreeMap<String, StreamId> = request
            .inputs
            .iter()
            .map(|(name, _)| (name.clone(), StreamId::new()))
            .collect();
        let output_ids: BTreeMap<String, StreamId> = request
            .outputs
            .iter()
            .map(|(name, _)| (name.clone(), StreamId::new()))
            .collect();

        let mut demux = Demux::new(
            invocation_id.clone(),
            self.config.max_pending_fragments,
            Arc::clone(&self.codec),
            self.metrics.clone(),
        );
        for (name, pipe) in &request.outputs {
            if let Some(id) = output_ids.get(name) {
                demux.add_output(name.clone(), id.clone(), pipe.clone());
            }
        }
        let demux = Arc::new(Mutex::new(demux));
        {
            let demux = Arc::clone(&demux);
            manager.on_message(move |message| demux.lock().handle_message(message));
        }

        let action = Action {
            target_spec: TargetSpec { id: request.target.clone() },
            name: request.name.clone(),
            inputs: named_ids(&request.inputs, &input_ids),
            outputs: named_ids(&request.outputs, &output_ids),
            configs: request.configs.clone(),
        };
        manager.send(&SessionMessage::action(action)).await?;
        self.count("evergreen.invocations", 1);

        tracing::info!(
            session_id = %request.session_id,
            invocation_id = %invocation_id,
            action_target = %request.target,
            action = %request.name,
            inputs = request.inputs.len(),
            outputs = request.outputs.len(),
            "Action invoked"
        );

        let cancel = CancellationToken::new();
        let (fragments_tx, fragments_rx) = mpsc::channel(self.config.send_queue.max(1));
        let mut tasks = Vec::with_capacity(request.inputs.len() + 1);
        for (name, pipe) in request.inputs {
            let Some(id) = input_ids.get(&name).cloned() else {
                continue;
            };
            tasks.push(tokio::spawn(pump_input(Pump {
                invocation_id: invocation_id.clone(),
                name,
                id,
                pipe,
                codec: Arc::clone(&self.codec),
                tx: fragments_tx.clone(),
                cancel: cancel.clone(),
            })));
        }
        drop(fragments_tx);
        tasks.push(tokio::spawn(send_fragments(
            manager,
            fragments_rx,
            invocation_id.clone(),
            self.metrics.clone(),
        )));

        Ok(Invocation {
            id: invocation_id,
            input_ids,
            output_ids,
            cancel,
            tasks: Mutex::new(tasks),
            demux,
        })
    }

    fn count(&self, name: &str, n: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, n);
        }
    }
}

fn named_ids(fields: &[(String, Pipe)], ids: &BTreeMap<String, StreamId>) -> Vec<NamedId> {
    fields
        .iter()
        .filter_map(|(name, _)| {
            ids.get(name).map(|id| NamedId {
                name: name.clone(),
                id: id.clone(),
            })
        })
        .collect()
}

/// Handle on a running invocation.
pub struct Invocation {
    id: InvocationId,
    input_ids: BTreeMap<String, StreamId>,
    output_ids: BTreeMap<String, StreamId>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    demux: Arc<Mutex<Demux>>,
}

impl Invocation {
    pub fn id(&self) -> &InvocationId {
        &self.id
    }

    /// Wire ids assigned to each input field.
    pub fn input_ids(&self) -> &BTreeMap<String, StreamId> {
        &self.input_ids
    }

    pub fn output_ids(&self) -> &BTreeMap<String, StreamId> {
        &self.output_ids
    }

    /// True once every output pipe has closed or failed.
    pub fn is_complete(&self) -> bool {
        self.demux.lock().is_complete()
    }

    pub fn pending_fragments(&self) -> usize {
        self.demux.lock().pending_len()
    }

    /// Wait until every input has been pumped and flushed to the transport.
    pub async fn wait_inputs(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(invocation_id = %self.id, error = %e, "Input task failed");
            }
        }
    }

    /// Stop pumping inputs. Outputs and the remote action are unaffected.
    pub fn abort(&self) {
        tracing::debug!(invocation_id = %self.id, "Aborting input pumps");
        self.cancel.cancel();
    }
}

struct Pump {
    invocation_id: InvocationId,
    name: String,
    id: StreamId,
    pipe: Pipe,
    codec: Arc<dyn MimetypeCodec>,
    tx: mpsc::Sender<NodeFragment>,
    cancel: CancellationToken,
}

/// Stream one input pipe as `seq`-numbered leaf fragments, then a terminal
/// fragment. An input that errors is ended like one that closed.
async fn pump_input(pump: Pump) {
    let Pump {
        invocation_id,
        name,
        id,
        pipe,
        codec,
        tx,
        cancel,
    } = pump;
    let mut chunks = pipe.chunks();
    let mut seq = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(invocation_id = %invocation_id, input = %name, seq, "Input pump cancelled");
                return;
            }
            next = chunks.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                tracing::trace!(input = %name, seq, chunk = ?ChunkSummary::from(&chunk), "Pumping chunk");
                let fragment =
                    NodeFragment::leaf(id.clone(), seq, true, Some(encode_chunk(&chunk, codec.as_ref())));
                if tx.send(fragment).await.is_err() {
                    tracing::debug!(invocation_id = %invocation_id, input = %name, "Sender gone");
                    return;
                }
                seq += 1;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    invocation_id = %invocation_id,
                    input = %name,
                    error = %e,
                    "Input pipe failed, ending input"
                );
                break;
            }
            None => break,
        }
    }

    if tx.send(NodeFragment::leaf(id, seq, false, None)).await.is_err() {
        tracing::debug!(invocation_id = %invocation_id, input = %name, "Sender gone before end marker");
        return;
    }
    tracing::debug!(invocation_id = %invocation_id, input = %name, fragments = seq + 1, "Input complete");
}

/// Drain queued fragments onto the connection, batching whatever is ready.
async fn send_fragments(
    manager: Arc<ConnectionManager>,
    mut rx: mpsc::Receiver<NodeFragment>,
    invocation_id: InvocationId,
    metrics: Option<Arc<MetricsRecorder>>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }
        let count = batch.len() as u64;
        if let Err(e) = manager.send(&SessionMessage::fragments(batch)).await {
            tracing::warn!(
                invocation_id = %invocation_id,
                kind = e.error_kind(),
                error = %e,
                "Dropping input fragments, connection unusable"
            );
            return;
        }
        if let Some(metrics) = &metrics {
            metrics.increment_counter("evergreen.fragments_sent", count);
        }
    }
}
