use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::errors::StreamError;
use crate::ids::PipeId;
use crate::stream::{Broadcast, Cursor, Leaves, StreamItem};

struct PipeEntry {
    stream: Broadcast<Chunk>,
    last_seq: Option<u64>,
}

impl PipeEntry {
    fn new() -> Self {
        Self {
            stream: Broadcast::new(),
            last_seq: None,
        }
    }
}

/// Session-scoped table of sequenced chunk streams.
///
/// Every id gets a stream on first reference. Writes must carry
/// `seq == last_seq + 1` (starting at 0); there is no reordering buffer, so a
/// gap is reported to the writer as [`StreamError::OutOfOrder`].
#[derive(Clone, Default)]
pub struct SessionRegistry {
    pipes: Arc<DashMap<PipeId, PipeEntry>>,
    closed: Arc<AtomicBool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequenced write. `item == None` is a pure control marker;
    /// `continued == false` ends the stream for `id`.
    pub fn write(
        &self,
        id: &PipeId,
        item: Option<StreamItem<Chunk>>,
        seq: u64,
        continued: bool,
    ) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let mut entry = self.pipes.entry(id.clone()).or_insert_with(PipeEntry::new);
        let expected = entry.last_seq.map_or(0, |last| last + 1);
        if seq != expected {
            tracing::warn!(pipe_id = %id, expected, seq, "Out of order pipe write");
            return Err(StreamError::OutOfOrder {
                id: id.to_string(),
                expected,
                actual: seq,
            });
        }
        if let Some(item) = item {
            entry.stream.write(item)?;
        }
        entry.last_seq = Some(seq);
        if !continued {
            entry.stream.close();
            tracing::debug!(pipe_id = %id, seq, "Pipe closed by terminal marker");
        }
        Ok(())
    }

    pub fn error(&self, id: &PipeId, reason: StreamError) {
        tracing::debug!(pipe_id = %id, kind = reason.error_kind(), "Pipe errored");
        self.stream(id).error(reason);
    }

    /// Stream for `id`, created if this is the first reference.
    pub fn stream(&self, id: &PipeId) -> Broadcast<Chunk> {
        if self.closed.load(Ordering::Acquire) {
            let stream = Broadcast::new();
            stream.close();
            return stream;
        }
        self.pipes
            .entry(id.clone())
            .or_insert_with(PipeEntry::new)
            .stream
            .clone()
    }

    pub fn last_seq(&self, id: &PipeId) -> Option<u64> {
        self.pipes.get(id).and_then(|entry| entry.last_seq)
    }

    /// New pipe with a fresh id bound to this registry.
    pub fn create_pipe(&self) -> Pipe {
        let id = PipeId::new();
        let stream = self.stream(&id);
        Pipe {
            inner: Arc::new(PipeInner {
                id,
                registry: self.clone(),
                stream,
                next_seq: Mutex::new(0),
            }),
        }
    }

    /// Close every stream and forget them. Later writes fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let streams: Vec<Broadcast<Chunk>> =
            self.pipes.iter().map(|entry| entry.stream.clone()).collect();
        self.pipes.clear();
        for stream in streams {
            stream.close();
        }
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

struct PipeInner {
    id: PipeId,
    registry: SessionRegistry,
    stream: Broadcast<Chunk>,
    next_seq: Mutex<u64>,
}

/// Readable and writable handle on one registry id.
///
/// Clones share the same id and sequence counter.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("stream", &self.inner.stream)
            .finish()
    }
}

impl Pipe {
    pub fn id(&self) -> &PipeId {
        &self.inner.id
    }

    pub fn write(&self, item: impl Into<StreamItem<Chunk>>) -> Result<(), StreamError> {
        let mut seq = self.inner.next_seq.lock();
        self.inner
            .registry
            .write(&self.inner.id, Some(item.into()), *seq, true)?;
        *seq += 1;
        Ok(())
    }

    /// Write the payload-less terminal marker.
    pub fn close(&self) -> Result<(), StreamError> {
        let mut seq = self.inner.next_seq.lock();
        self.inner.registry.write(&self.inner.id, None, *seq, false)?;
        *seq += 1;
        Ok(())
    }

    pub fn error(&self, reason: StreamError) {
        self.inner.registry.error(&self.inner.id, reason);
    }

    pub fn stream(&self) -> &Broadcast<Chunk> {
        &self.inner.stream
    }

    pub fn subscribe(&self) -> Cursor<Chunk> {
        self.inner.stream.subscribe()
    }

    /// Depth-first chunk reader.
    pub fn chunks(&self) -> Leaves<Chunk> {
        self.inner.stream.leaves()
    }

    pub async fn read_all(&self) -> Result<Vec<Chunk>, StreamError> {
        self.inner.stream.read_all().await
    }

    pub fn is_open(&self) -> bool {
        self.inner.stream.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Option<StreamItem<Chunk>> {
        Some(StreamItem::Leaf(Chunk::text(s)))
    }

    #[test]
    fn sequence_must_increase_by_one() {
        let registry = SessionRegistry::new();
        let id = PipeId::new();
        registry.write(&id, text("a"), 0, true).unwrap();

        let err = registry.write(&id, text("c"), 2, true).unwrap_err();
        assert_eq!(
            err,
            StreamError::OutOfOrder { id: id.to_string(), expected: 1, actual: 2 }
        );
        assert_eq!(registry.last_seq(&id), Some(0));

        registry.write(&id, text("b"), 1, true).unwrap();
        assert_eq!(registry.last_seq(&id), Some(1));
    }

    #[test]
    fn first_write_must_be_zero() {
        let registry = SessionRegistry::new();
        let id = PipeId::new();
        assert!(matches!(
            registry.write(&id, text("a"), 1, true),
            Err(StreamError::OutOfOrder { expected: 0, .. })
        ));
    }

    #[tokio::test]
    async fn terminal_marker_closes_without_leaf() {
        let registry = SessionRegistry::new();
        let id = PipeId::new();
        registry.write(&id, text("only"), 0, true).unwrap();
        registry.write(&id, None, 1, false).unwrap();

        let stream = registry.stream(&id);
        assert!(stream.is_closed());
        assert_eq!(stream.len(), 1);
        let chunks = stream.read_all().await.unwrap();
        assert_eq!(chunks, vec![Chunk::text("only")]);

        assert_eq!(
            registry.write(&id, text("late"), 2, true).unwrap_err(),
            StreamError::Closed
        );
    }

    #[tokio::test]
    async fn pipe_numbers_writes_and_closes() {
        let registry = SessionRegistry::new();
        let pipe = registry.create_pipe();
        let reader = pipe.clone();

        pipe.write(Chunk::text("one")).unwrap();
        pipe.write(Chunk::text("two")).unwrap();
        pipe.close().unwrap();

        assert_eq!(registry.last_seq(pipe.id()), Some(2));
        let texts: Vec<String> = reader
            .read_all()
            .await
            .unwrap()
            .iter()
            .filter_map(|c| c.as_text().map(str::to_string))
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn concurrent_writers_on_one_pipe_stay_in_sequence() {
        let registry = SessionRegistry::new();
        let pipe = registry.create_pipe();

        let mut handles = Vec::new();
        for task in 0..4 {
            let pipe = pipe.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    pipe.write(Chunk::text(format!("{task}-{n}"))).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        pipe.close().unwrap();

        assert_eq!(registry.last_seq(pipe.id()), Some(100));
        assert_eq!(pipe.read_all().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn error_reaches_readers() {
        let registry = SessionRegistry::new();
        let pipe = registry.create_pipe();
        pipe.write(Chunk::text("before")).unwrap();
        pipe.error(StreamError::Decode("bad".into()));

        assert_eq!(pipe.read_all().await.unwrap_err(), StreamError::Decode("bad".into()));
        assert!(!pipe.is_open());
    }

    #[tokio::test]
    async fn registry_close_ends_every_stream() {
        let registry = SessionRegistry::new();
        let a = registry.create_pipe();
        let b = registry.create_pipe();
        a.write(Chunk::text("a")).unwrap();
        assert_eq!(registry.len(), 2);

        registry.close();
        assert!(registry.is_empty());
        assert!(a.stream().is_closed());
        assert!(b.stream().is_closed());
        assert_eq!(a.read_all().await.unwrap().len(), 1);
        assert_eq!(b.write(Chunk::text("late")).unwrap_err(), StreamError::Closed);
    }
}
