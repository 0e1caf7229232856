//! Backend adapters.
//!
//! One adapter per external system, each translating the pipeline definition
//! into desired resource specs and reconciling them declaratively: create
//! when absent, diff owned fields and re-apply when drifted, leave converged
//! resources untouched. Deletes are idempotent; absence is success. The
//! adapters never sequence one another — ordering across systems belongs to
//! the generation synchronizer.

mod compute;
mod log;
mod registry;
mod search;

pub use compute::ComputeAdapter;
pub use log::LogAdapter;
pub use registry::RegistryAdapter;
pub use search::SearchAdapter;
