pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::MemoryStore;
pub use sql::SqlStore;
pub use traits::{RecordStore, StorageError};
