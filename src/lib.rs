//! Music library transfer - shared modules for the replay binary and embedders.
//!
//! A job snapshots source collections, matches every track against the target
//! catalog, writes matched tracks in checkpointed batches and produces a
//! per-track report. Provider adapters plug in through the traits in `ports`.

pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod deadline;
pub mod error;
pub mod fixture;
pub mod matching;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod ports;
pub mod progress;
pub mod report;
pub mod safety;
pub mod scoring;
pub mod snapshot;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::TransferConfig;
pub use error::{JobAborted, ProviderError, TransferError};
pub use pipeline::{CollectionSelection, TransferPipeline};
pub use report::TransferReport;
