pub mod ports;
pub mod sqlite;

pub use ports::{IndexStore, StoreOp};
pub use sqlite::SqliteIndexStore;
