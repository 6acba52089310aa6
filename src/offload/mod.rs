pub mod value_store;

pub use value_store::{HostChunkBuffer, ValueStore};
