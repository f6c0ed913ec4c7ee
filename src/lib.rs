//! vdbstream - Streaming of animated sparse volumes into GPU memory

pub mod core;
pub mod math;
pub mod render;
pub mod streaming;
