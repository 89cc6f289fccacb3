//! Job store implementations.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryJobStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
