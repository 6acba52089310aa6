pub mod append;
pub mod gather;
pub mod landmark;
pub mod reconstruct;
pub mod retrieval;
pub mod sync;

pub use append::KvAppendOps;
pub use gather::ValueGatherOps;
pub use landmark::LandmarkOps;
pub use reconstruct::KeyReconstructOps;
pub use retrieval::ChunkSelectOps;
pub use sync::TransferSyncOps;
