pub mod cache;
pub mod connection;
pub mod error;
pub mod mock;
pub mod transport;
pub mod websocket;
pub mod wire;

pub use cache::{ConnectionCache, TransportFactory};
pub use connection::{ConnectionManager, ConnectionState, MessageCallback};
pub use error::TransportError;
pub use mock::{MemoryNetwork, MemoryPeer, MemoryTransport, StartBehavior};
pub use transport::{Frame, Transport, TransportEvent};
pub use websocket::{WebSocketFactory, WebSocketTransport};
pub use wire::{
    decode_chunk, encode_chunk, Action, NamedId, NodeFragment, SessionMessage, TargetSpec,
    WireChunk, WireMetadata,
};
