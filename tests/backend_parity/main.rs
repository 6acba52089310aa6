//! Backend parity tests: every shadowkv op computed on CPU, compared against
//! the CUDA backend when the feature is enabled.

pub mod helpers;

pub mod append;
pub mod gather;
pub mod landmark;
pub mod reconstruct;
pub mod retrieval;
