pub mod archive;
pub mod catalog;
pub mod docker;
pub mod error;
pub mod lock;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod sequencer;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::{ContainerEngine, DockerEngine};
pub use error::{Result, StackError};
pub use registry::{Registry, Selection};
pub use runner::OperationRunner;
