pub mod layer;
pub mod rope;
pub mod shadow;

pub use layer::LayerCache;
pub use rope::RopeCaches;
pub use shadow::{CachePhase, ShadowKvCache};
