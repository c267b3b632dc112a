//! Default implementations of [crate::backend::Connector]

#[cfg(feature = "redis")]
pub mod redis_async;
