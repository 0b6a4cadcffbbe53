//! Durable per-model input storage.
//!
//! The swap controller asks this layer two questions: does a model still have
//! unconsumed input, and which models have any. Slots pull records from it
//! while a model is running and ack each record once the model consumed it.

pub mod backend;
pub mod error;
pub mod memory;
pub mod spool;
pub mod store;

pub use backend::{open_store, StoreKind, StoreSettings};
pub use error::StorageError;
pub use memory::MemoryInputStore;
pub use spool::SpoolStore;
pub use store::InputStore;
