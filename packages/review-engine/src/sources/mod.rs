//! Knowledge source and language model adapters.

pub mod memory;
pub mod rate_limited;

pub use memory::{MemoryAuthority, MemoryKnowledgeSource};
pub use rate_limited::{RateLimitedModel, RateLimitedModelBuilder};
