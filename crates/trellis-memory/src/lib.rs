pub mod store;

pub use store::SqliteMemory;
