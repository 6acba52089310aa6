pub mod selector;

pub use selector::{materialise_selection, SelectedChunks};
