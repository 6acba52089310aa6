pub mod lowrank;
pub mod outlier;

pub use lowrank::{factorize_heads, HeadFactors};
pub use outlier::{partition_chunks, ChunkPartition};
