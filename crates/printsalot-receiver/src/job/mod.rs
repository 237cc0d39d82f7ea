//! Print job execution.

pub mod dispatcher;

pub use dispatcher::{JobDispatcher, JobError, StatusReporter};
