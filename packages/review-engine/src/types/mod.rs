pub mod citation;
pub mod config;
pub mod event;
pub mod evidence;
pub mod ids;
pub mod job;
pub mod ontology;
pub mod result;
pub mod task;
pub mod verdict;
