// kmem Engine: encrypted on-device memory
// Key hierarchy, encrypted SQLite store, ANN index, retrieval policy,
// signed snapshots and off-device backups, driven through one worker thread.

pub mod ann;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod facade;
pub mod paths;
pub mod pii;
pub mod retrieval;
pub mod snapshot;
pub mod store;
pub(crate) mod worker;
