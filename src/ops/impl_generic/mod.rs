pub mod landmark;
pub mod reconstruct;
pub mod retrieval;

pub use landmark::{chunk_landmarks_impl, chunk_min_cosine_impl};
pub use reconstruct::reconstruct_rotated_keys_impl;
pub use retrieval::select_topk_chunks_impl;
