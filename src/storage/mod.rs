//! Object storage backends.
//!
//! The [`backend::ObjectStore`] trait abstracts over where bytes
//! physically live.  Implementations include an in-memory store and an
//! S3 client that also speaks to S3-compatible servers such as MinIO.

pub mod aws;
pub mod backend;
pub mod memory;
