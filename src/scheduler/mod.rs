//! Job records and dispatch.
//!
//! - [`job`]: the job model and its lifecycle
//! - [`store`]: canonical, lock-per-job record of all jobs
//! - [`load`]: per-host load snapshots derived from the store
//! - [`dispatcher`]: host selection and the dispatch loop

pub mod dispatcher;
pub mod job;
pub mod load;
pub mod store;

pub use dispatcher::{select_target, DispatchReport, DispatchSnapshot, DispatchTarget, Dispatcher};
pub use job::{Job, JobId, JobSignature, JobStatus, JobUpdate, NewJob};
pub use load::{NodeLoad, SystemLoad};
pub use store::{CountFilter, JobEvent, JobStore};
