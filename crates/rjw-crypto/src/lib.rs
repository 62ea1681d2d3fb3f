//! Content hashing for generated documents.
//!
//! Wraps BLAKE3 with a domain tag so a document hash can never be confused
//! with a hash computed for another purpose over the same bytes.

pub mod hasher;

pub use hasher::ContentHasher;
