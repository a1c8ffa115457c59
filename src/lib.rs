//! focalpoint: a proof-of-work ledger of considerations.
//!
//! The ledger tracks integer imbalances (received minus sent unit
//! considerations) per public key. Recipients decode as structured keys
//! which a PageRank-style indexer folds into a weighted graph, and that
//! graph feeds back into consensus through an ancestry check on admission.

pub mod checkpoints;
pub mod consideration;
pub mod consideration_queue;
pub mod constants;
pub mod error;
pub mod graph;
pub mod imbalance_cache;
pub mod indexer;
pub mod ledger;
pub mod olc;
pub mod processor;
pub mod protocol;
pub mod renderer;
pub mod retarget;
pub mod view;
pub mod view_header_hasher;
pub mod view_storage;

pub use consideration::{Consideration, ConsiderationID, PublicKey, Signature};
pub use consideration_queue::{ConsiderationQueue, ConsiderationQueueMemory};
pub use error::{LedgerError, ProcessError, StorageError, ValidationError};
pub use graph::Graph;
pub use imbalance_cache::ImbalanceCache;
pub use indexer::Indexer;
pub use ledger::{BranchType, Ledger, LedgerDisk};
pub use processor::{NewTx, Processor, TipChange};
pub use renderer::{HashrateMonitor, Renderer};
pub use view::{View, ViewHeader, ViewID};
pub use view_header_hasher::ViewHeaderHasher;
pub use view_storage::{ViewStorage, ViewStorageDisk, ViewStorageMemory};
