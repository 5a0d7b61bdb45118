//! Transfer pipeline: outbound chunk production and inbound assembly.

pub mod assembly;
pub mod producer;

pub use assembly::{AssemblyTable, BeginOutcome, TransferMetadata};
pub use producer::{Chunk, ChunkProducer, FileSource};
