//! Draft log reconciliation.
//!
//! An out-of-band synchronization protocol that materialises append-entries
//! and votes across replicated message files and reconstructs a consistent
//! log view, without touching the canonical Raft kernel.

pub mod analyzer;
pub mod collector;
pub mod imf;
pub mod interpreter;
pub mod merge;
pub mod parallel;
pub mod primitives;
pub mod sandbox;

pub use analyzer::{AnalysisPolicy, MimicRaftAnalyzer, RackProgress};
pub use imf::{ImfReader, ImfWriter, MemoryImf, ReadOnlyImf};
pub use interpreter::{OneToOneInterpreter, OneToOneInterpreterBuilder};
pub use parallel::ParallelInterpreter;
pub use primitives::{
    AeUpdate, PreservablePrimitives, PrimitiveProvider, Primitives, Update, UpdatePayload,
};
pub use sandbox::AnalyzerSandbox;
