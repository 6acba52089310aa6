pub mod append;
pub mod gather;
pub mod kernels;
pub mod landmark;
pub mod pinned;
pub mod reconstruct;
pub mod retrieval;
pub mod stream;
pub mod sync;
