//! GPU device setup for the upload backend

pub mod context;

pub use context::GpuContext;
