//! Delayed job scheduling with pluggable stores.

pub mod libsql_store;
pub mod memory;
pub mod migrations;
pub mod model;
pub mod scheduler;
pub mod store;

pub use libsql_store::LibSqlJobStore;
pub use memory::MemoryJobStore;
pub use model::{
    Job, JobCounts, JobFilter, JobList, JobStatus, JobStatusReport, NewJob, QueueHealth,
    ScheduleOutcome,
};
pub use scheduler::{
    FnHandler, JobHandler, JobScheduler, spawn_cleanup_ticker, spawn_due_job_ticker,
};
pub use store::{JobProvider, JobStore};
