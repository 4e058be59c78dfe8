mod codec;
mod edges;
mod lanes;
mod patches;
pub mod rows;
pub mod schema;
pub mod store;

#[cfg(test)]
mod testing;

pub use codec::ts;
pub use rows::{GraphRows, Transition};
pub use store::{lock_key, SqliteStore};
