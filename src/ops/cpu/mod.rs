pub mod append;
pub mod gather;
pub mod landmark;
pub mod reconstruct;
pub mod retrieval;
pub mod sync;
