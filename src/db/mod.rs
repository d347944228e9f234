//! SQLite persistence: models and the store.

mod models;
mod store;

pub use models::*;
pub use store::*;
