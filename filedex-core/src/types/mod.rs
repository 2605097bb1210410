// Index domain types shared by the store, reconciler and consumers

pub mod category;
pub mod events;
pub mod files;
pub mod library;

pub use category::*;
pub use events::*;
pub use files::*;
pub use library::*;
