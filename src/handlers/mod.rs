//! HTTP handlers.

pub mod objects;
pub mod upload;
