//! Storage stack: a fast hot tier (§4.4), a durable CSV side-writer
//! (§4.5), a columnar cold tier (§4.6), the archiver that moves data
//! between them, and the router that presents them as one façade (§4.7).

pub mod append_log;
pub mod archiver;
pub mod cold_archive;
pub mod hot_store;
pub mod router;

pub use append_log::{AppendLog, AppendLogConfig};
pub use archiver::{ArchiveReport, Archiver};
pub use cold_archive::ColdArchive;
pub use hot_store::{HotStore, HotStoreConfig};
pub use router::StorageRouter;
