//! Replayable broadcast stream of possibly-nested items.
//!
//! A [`Broadcast`] owns an append-only log. Every [`Cursor`] returned by
//! [`Broadcast::subscribe`] first replays the log, then receives live writes,
//! then observes the terminal state. Each cursor has its own unbounded queue,
//! so a slow reader never holds back the writer or other readers.
//!
//! Items may be trees: a [`StreamItem`] is a leaf, an ordered sequence, or a
//! nested broadcast. [`Leaves`] flattens them depth-first, left to right, and
//! drains a nested broadcast completely before moving to its next sibling.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::StreamError;

/// One entry in a broadcast log.
#[derive(Clone, Debug)]
pub enum StreamItem<T> {
    Leaf(T),
    Seq(Vec<StreamItem<T>>),
    /// Asynchronously produced children. Replayable like any other broadcast.
    Nested(Broadcast<T>),
}

impl<T> StreamItem<T> {
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    pub fn seq(items: impl IntoIterator<Item = StreamItem<T>>) -> Self {
        Self::Seq(items.into_iter().collect())
    }
}

impl<T: Clone + Send + Sync + 'static> StreamItem<T> {
    /// Adapt an arbitrary async sequence into a nested item.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = StreamItem<T>> + Send + 'static,
    {
        Self::Nested(Broadcast::from_stream(stream))
    }
}

impl<T> From<T> for StreamItem<T> {
    fn from(value: T) -> Self {
        Self::Leaf(value)
    }
}

type Delivery<T> = Result<StreamItem<T>, StreamError>;

#[derive(Clone, Debug)]
enum State {
    Open,
    Closed,
    Errored(StreamError),
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery<T>>,
}

struct Shared<T> {
    log: Vec<StreamItem<T>>,
    state: State,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber: u64,
}

/// Write-once, read-many stream with full replay for late subscribers.
pub struct Broadcast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Broadcast")
            .field("len", &shared.log.len())
            .field("state", &shared.state)
            .field("subscribers", &shared.subscribers.len())
            .finish()
    }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                log: Vec::new(),
                state: State::Open,
                subscribers: Vec::new(),
                next_subscriber: 0,
            })),
        }
    }

    /// Append an item and deliver it to every live cursor.
    pub fn write(&self, item: StreamItem<T>) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        if !matches!(shared.state, State::Open) {
            return Err(StreamError::Closed);
        }
        shared
            .subscribers
            .retain(|sub| sub.tx.send(Ok(item.clone())).is_ok());
        shared.log.push(item);
        Ok(())
    }

    pub fn write_leaf(&self, value: T) -> Result<(), StreamError> {
        self.write(StreamItem::Leaf(value))
    }

    /// Mark the stream finished. Idempotent; a no-op once errored.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        if matches!(shared.state, State::Open) {
            shared.state = State::Closed;
            // Dropping the senders ends each cursor after its backlog.
            shared.subscribers.clear();
        }
    }

    /// Fail the stream. Cursors see their queued items before `reason`.
    pub fn error(&self, reason: StreamError) {
        let mut shared = self.shared.lock();
        if !matches!(shared.state, State::Open) {
            return;
        }
        for sub in shared.subscribers.drain(..) {
            let _ = sub.tx.send(Err(reason.clone()));
        }
        shared.state = State::Errored(reason);
    }

    /// New cursor: snapshot replay, then live items, then close/error.
    pub fn subscribe(&self) -> Cursor<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        for item in &shared.log {
            let _ = tx.send(Ok(item.clone()));
        }

        let id = shared.next_subscriber;
        shared.next_subscriber += 1;
        match &shared.state {
            State::Open => shared.subscribers.push(Subscriber { id, tx }),
            State::Closed => {}
            State::Errored(reason) => {
                let _ = tx.send(Err(reason.clone()));
            }
        }

        Cursor {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Depth-first leaf reader.
    pub fn leaves(&self) -> Leaves<T> {
        Leaves {
            stack: vec![Frame::Cursor(self.subscribe())],
        }
    }

    /// Read to completion and collect every leaf in order.
    pub async fn read_all(&self) -> Result<Vec<T>, StreamError> {
        self.leaves().try_collect().await
    }

    pub fn is_open(&self) -> bool {
        matches!(self.shared.lock().state, State::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.shared.lock().state, State::Closed)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.shared.lock().state, State::Errored(_))
    }

    /// Number of top-level items written so far.
    pub fn len(&self) -> usize {
        self.shared.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Broadcast<T> {
    /// Forward an async sequence into a new broadcast, closing it at the end.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = StreamItem<T>> + Send + 'static,
    {
        let target = Self::new();
        let writer = target.clone();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                if writer.write(item).is_err() {
                    return;
                }
            }
            writer.close();
        });
        target
    }
}

/// One subscriber's view of a [`Broadcast`]. Dropping it unsubscribes.
pub struct Cursor<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Delivery<T>>,
    shared: Weak<Mutex<Shared<T>>>,
}

impl<T> Unpin for Cursor<T> {}

impl<T> Cursor<T> {
    /// Next top-level item, `None` once the stream is closed.
    pub async fn next_item(&mut self) -> Option<Delivery<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for Cursor<T> {
    type Item = Delivery<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let id = self.id;
            shared.lock().subscribers.retain(|sub| sub.id != id);
        }
    }
}

enum Frame<T> {
    Items(std::vec::IntoIter<StreamItem<T>>),
    Cursor(Cursor<T>),
}

/// Depth-first flattening of a broadcast into its leaves.
///
/// Dropping the reader drops every cursor it holds, nested ones included.
pub struct Leaves<T> {
    stack: Vec<Frame<T>>,
}

impl<T> Unpin for Leaves<T> {}

impl<T: Clone> Stream for Leaves<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            let Some(frame) = this.stack.last_mut() else {
                return Poll::Ready(None);
            };
            let next = match frame {
                Frame::Items(items) => items.next().map(Ok),
                Frame::Cursor(cursor) => match Pin::new(cursor).poll_next(cx) {
                    Poll::Ready(next) => next,
                    Poll::Pending => return Poll::Pending,
                },
            };
            match next {
                None => {
                    this.stack.pop();
                }
                Some(Err(reason)) => {
                    this.stack.clear();
                    return Poll::Ready(Some(Err(reason)));
                }
                Some(Ok(StreamItem::Leaf(value))) => return Poll::Ready(Some(Ok(value))),
                Some(Ok(StreamItem::Seq(items))) => this.stack.push(Frame::Items(items.into_iter())),
                Some(Ok(StreamItem::Nested(inner))) => this.stack.push(Frame::Cursor(inner.subscribe())),
            }
        }
    }
}
