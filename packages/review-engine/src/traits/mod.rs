//! Core trait abstractions for the review engine.
//!
//! These traits define the narrow contracts the engine consumes: retrieval,
//! the language model, progress publishing and persistence.

pub mod knowledge;
pub mod model;
pub mod publisher;
pub mod store;
