pub mod chunk;
pub mod errors;
pub mod ids;
pub mod session;
pub mod stream;

pub use chunk::{BasicMimetypeCodec, Chunk, ChunkMetadata, ChunkSummary, Mimetype, MimetypeCodec};
pub use errors::StreamError;
pub use ids::{InvocationId, PipeId, SessionId, StreamId};
pub use session::{Pipe, SessionRegistry};
pub use stream::{Broadcast, Cursor, Leaves, StreamItem};
