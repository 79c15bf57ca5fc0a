//! Handing jobs to worker hosts.
//!
//! Processing happens out of process: the dispatcher only tells a host's
//! service to start (or stop) a job. Hosts report progress back through
//! [`ServiceRegistry::update_job`](crate::registry::ServiceRegistry::update_job).
//!
//! - [`JobLauncher`]: seam between the dispatcher and the hosts
//! - [`HttpLauncher`]: launcher speaking HTTP through a [`Transport`](crate::remote::Transport)

pub mod launcher;

pub use launcher::{HttpLauncher, JobLauncher};
