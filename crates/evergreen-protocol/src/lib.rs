pub mod config;
pub mod demux;
pub mod engine;
pub mod error;

pub use config::EvergreenConfig;
pub use demux::Demux;
pub use engine::{ActionRequest, Evergreen, Invocation};
pub use error::EvergreenError;
