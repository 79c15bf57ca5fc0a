use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::remote::{Method, RemoteRequest, Transport};
use crate::scheduler::dispatcher::DispatchTarget;
use crate::scheduler::job::Job;

/// Hands claimed jobs to the service that will process them.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start `job` on `target`. An error means the host did not accept it.
    async fn launch(&self, target: &DispatchTarget, job: &Job) -> Result<()>;

    /// Ask `target` to stop working on `job`.
    async fn cancel(&self, target: &DispatchTarget, job: &Job) -> Result<()>;
}

/// Launches jobs by calling the service endpoint on the target host:
/// `POST {host}{path}/dispatch` with the job as JSON, and
/// `DELETE {host}{path}/job/{id}` to cancel.
pub struct HttpLauncher<T> {
    transport: T,
}

impl<T: Transport> HttpLauncher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

fn service_url(target: &DispatchTarget, suffix: &str) -> String {
    format!(
        "{}/{}/{}",
        target.host.trim_end_matches('/'),
        target.service_path.trim_matches('/'),
        suffix
    )
}

#[async_trait]
impl<T: Transport> JobLauncher for HttpLauncher<T> {
    async fn launch(&self, target: &DispatchTarget, job: &Job) -> Result<()> {
        let body = serde_json::to_value(job)
            .map_err(|e| DispatchError::InvalidArgument(format!("unencodable job: {}", e)))?;
        let request = RemoteRequest::new(Method::Post, service_url(target, "dispatch")).json(body);

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(DispatchError::transport(
                Some(response.status),
                format!("{} refused job {}", target.host, job.id),
            ));
        }
        Ok(())
    }

    async fn cancel(&self, target: &DispatchTarget, job: &Job) -> Result<()> {
        let request = RemoteRequest::new(
            Method::Delete,
            service_url(target, &format!("job/{}", job.id)),
        );

        let response = self.transport.send(request).await?;
        // Already gone on the host is fine.
        if !response.is_success() && response.status != 404 {
            return Err(DispatchError::transport(
                Some(response.status),
                format!("{} did not cancel job {}", target.host, job.id),
            ));
        }
        Ok(())
    }
}
