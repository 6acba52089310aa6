pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod impl_generic;
pub mod traits;

pub use traits::ChunkSelectOps;
pub use traits::KeyReconstructOps;
pub use traits::KvAppendOps;
pub use traits::LandmarkOps;
pub use traits::TransferSyncOps;
pub use traits::ValueGatherOps;

// Re-export numr's TensorOps which bundles all operation traits
pub use numr::ops::traits::TensorOps;
