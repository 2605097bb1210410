//! Repository ports (interfaces). The reconciler and facade depend on these
//! traits only; implementations live next to them under `database::sqlite`.

pub mod index_store;

pub use index_store::{IndexStore, StoreOp};
