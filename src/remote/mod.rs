//! Client for a registry served by another process.
//!
//! [`RemoteRegistry`] mirrors the operations of
//! [`ServiceRegistry`](crate::registry::ServiceRegistry) over HTTP. The
//! transport is injected, so tests run against an in-memory fake and the
//! binary uses [`HttpTransport`].
//!
//! Status mapping: 404 becomes the matching not-found error, any other
//! unexpected status a [`DispatchError::Transport`] carrying the code.

pub mod http;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::registry::{HostRegistration, HostSpec, ServiceRegistration, ServiceStatistics};
use crate::scheduler::job::{Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::scheduler::load::{NodeLoad, SystemLoad};
use crate::scheduler::store::CountFilter;

pub use http::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// One HTTP exchange, independent of the client library.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Url-encoded form body.
    pub form: Vec<(String, String)>,
    /// JSON body, sent instead of the form when set.
    pub json: Option<serde_json::Value>,
}

impl RemoteRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
            json: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends a request and returns whatever status came back. Only failures to
/// complete the exchange are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}

/// Where the registry lives and who is calling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the registry endpoints.
    pub service_url: String,
    /// Base URL of the calling host.
    pub server_url: String,
}

impl RemoteConfig {
    pub fn new(service_url: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            server_url: server_url.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.service_url.starts_with("http://") && !self.service_url.starts_with("https://") {
            return Err(DispatchError::Configuration(format!(
                "service url '{}' is not an http(s) url",
                self.service_url
            )));
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.service_url.trim_end_matches('/'), path)
    }
}

/// What a 404 from an endpoint means.
enum Missing<'a> {
    Job(JobId),
    Host(&'a str),
    Service(&'a str, &'a str),
}

impl Missing<'_> {
    fn into_error(self) -> DispatchError {
        match self {
            Missing::Job(id) => DispatchError::JobNotFound(id),
            Missing::Host(host) => DispatchError::HostNotFound(host.to_string()),
            Missing::Service(service_type, host) => DispatchError::ServiceNotFound {
                service_type: service_type.to_string(),
                host: host.to_string(),
            },
        }
    }
}

pub struct RemoteRegistry<T> {
    transport: T,
    config: RemoteConfig,
}

impl<T: Transport> RemoteRegistry<T> {
    pub fn new(transport: T, config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RemoteRequest {
        RemoteRequest::new(method, self.config.endpoint(path))
    }

    async fn call(
        &self,
        request: RemoteRequest,
        expected: u16,
        missing: Option<Missing<'_>>,
    ) -> Result<RemoteResponse> {
        let method = request.method;
        let url = request.url.clone();
        let response = self.transport.send(request).await?;

        if response.status == expected {
            return Ok(response);
        }
        if response.status == 404 {
            if let Some(missing) = missing {
                return Err(missing.into_error());
            }
        }

        tracing::debug!(
            method = %method,
            url = %url,
            status = response.status,
            "Unexpected registry response"
        );
        Err(DispatchError::transport(
            Some(response.status),
            format!("{} {} returned {}", method, url, response.status),
        ))
    }

    async fn fetch<R: DeserializeOwned>(
        &self,
        request: RemoteRequest,
        missing: Option<Missing<'_>>,
    ) -> Result<R> {
        let response = self.call(request, 200, missing).await?;
        decode(&response.body)
    }

    // ========== Hosts ==========

    pub async fn register_host(&self, spec: &HostSpec) -> Result<()> {
        let request = self
            .request(Method::Post, "registerhost")
            .field("host", &spec.host)
            .field("address", &spec.address)
            .field("memory", spec.memory)
            .field("cores", spec.cores)
            .field("maxLoad", spec.max_load);
        self.call(request, 204, None).await.map(|_| ())
    }

    pub async fn unregister_host(&self, host: &str) -> Result<()> {
        let request = self.request(Method::Post, "unregisterhost").field("host", host);
        self.call(request, 204, Some(Missing::Host(host)))
            .await
            .map(|_| ())
    }

    pub async fn enable_host(&self, host: &str) -> Result<()> {
        let request = self.request(Method::Post, "enablehost").field("host", host);
        self.call(request, 204, Some(Missing::Host(host)))
            .await
            .map(|_| ())
    }

    pub async fn disable_host(&self, host: &str) -> Result<()> {
        let request = self.request(Method::Post, "disablehost").field("host", host);
        self.call(request, 204, Some(Missing::Host(host)))
            .await
            .map(|_| ())
    }

    pub async fn set_maintenance(&self, host: &str, maintenance: bool) -> Result<()> {
        let request = self
            .request(Method::Post, "maintenance")
            .field("host", host)
            .field("maintenance", maintenance);
        self.call(request, 204, Some(Missing::Host(host)))
            .await
            .map(|_| ())
    }

    pub async fn host_registrations(&self) -> Result<Vec<HostRegistration>> {
        self.fetch(self.request(Method::Get, "hosts.xml"), None).await
    }

    // ========== Services ==========

    pub async fn register_service(
        &self,
        service_type: &str,
        host: &str,
        path: &str,
        job_producer: bool,
    ) -> Result<ServiceRegistration> {
        let request = self
            .request(Method::Post, "register")
            .field("serviceType", service_type)
            .field("host", host)
            .field("path", path)
            .field("jobProducer", job_producer);
        self.fetch(request, Some(Missing::Host(host))).await
    }

    pub async fn unregister_service(&self, service_type: &str, host: &str) -> Result<()> {
        let request = self
            .request(Method::Post, "unregister")
            .field("serviceType", service_type)
            .field("host", host);
        self.call(request, 204, Some(Missing::Service(service_type, host)))
            .await
            .map(|_| ())
    }

    /// `None` when the pair is not registered.
    pub async fn service_registration(
        &self,
        service_type: &str,
        host: &str,
    ) -> Result<Option<ServiceRegistration>> {
        let request = self
            .request(Method::Get, "services.xml")
            .query("serviceType", service_type)
            .query("host", host);
        match self
            .fetch(request, Some(Missing::Service(service_type, host)))
            .await
        {
            Ok(service) => Ok(Some(service)),
            Err(DispatchError::ServiceNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn services_by_host(&self, host: &str) -> Result<Vec<ServiceRegistration>> {
        let request = self.request(Method::Get, "services.xml").query("host", host);
        self.fetch(request, None).await
    }

    pub async fn services_by_type(&self, service_type: &str) -> Result<Vec<ServiceRegistration>> {
        let request = self
            .request(Method::Get, "services.xml")
            .query("serviceType", service_type);
        self.fetch(request, None).await
    }

    pub async fn service_registrations(&self) -> Result<Vec<ServiceRegistration>> {
        self.fetch(self.request(Method::Get, "services.xml"), None)
            .await
    }

    pub async fn services_by_load(&self, service_type: &str) -> Result<Vec<ServiceRegistration>> {
        let request = self
            .request(Method::Get, "available.xml")
            .query("serviceType", service_type);
        self.fetch(request, None).await
    }

    pub async fn statistics(&self) -> Result<Vec<ServiceStatistics>> {
        self.fetch(self.request(Method::Get, "statistics.xml"), None)
            .await
    }

    pub async fn sanitize(&self, service_type: &str, host: &str) -> Result<()> {
        let request = self
            .request(Method::Post, "sanitize")
            .field("serviceType", service_type)
            .field("host", host);
        self.call(request, 204, Some(Missing::Service(service_type, host)))
            .await
            .map(|_| ())
    }

    pub async fn count_of_abnormal_services(&self) -> Result<u64> {
        let response = self
            .call(self.request(Method::Get, "servicewarnings"), 200, None)
            .await?;
        parse_count(&response.body)
    }

    // ========== Jobs ==========

    /// Submit a job. An unset creator becomes this client's server url.
    pub async fn create_job(&self, job: &NewJob) -> Result<Job> {
        let creator = if job.creator_host.is_empty() {
            self.config.server_url.as_str()
        } else {
            job.creator_host.as_str()
        };

        let mut request = self
            .request(Method::Post, "job")
            .field("jobType", &job.job_type)
            .field("host", creator)
            .field("operation", &job.operation)
            .field("start", job.queueable)
            .field("jobLoad", job.job_load);
        for argument in &job.arguments {
            request = request.field("arg", argument);
        }
        if let Some(payload) = &job.payload {
            request = request.field("payload", payload);
        }
        if let Some(parent) = job.parent_id {
            request = request.field("parent", parent);
        }

        let response = self.call(request, 201, None).await?;
        decode(&response.body)
    }

    pub async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<()> {
        let body = serde_json::to_value(update)
            .map_err(|e| DispatchError::InvalidArgument(format!("unencodable update: {}", e)))?;
        let request = self
            .request(Method::Put, &format!("job/{}.xml", id))
            .json(body);
        self.call(request, 204, Some(Missing::Job(id)))
            .await
            .map(|_| ())
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let request = self.request(Method::Get, &format!("job/{}.xml", id));
        self.fetch(request, Some(Missing::Job(id))).await
    }

    pub async fn child_jobs(&self, id: JobId) -> Result<Vec<Job>> {
        let request = self.request(Method::Get, &format!("job/{}/children.xml", id));
        self.fetch(request, Some(Missing::Job(id))).await
    }

    pub async fn jobs(&self, service_type: &str, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut request = self
            .request(Method::Get, "jobs.xml")
            .query("serviceType", service_type);
        if let Some(status) = status {
            request = request.query("status", status);
        }
        self.fetch(request, None).await
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        self.fetch(self.request(Method::Get, "activeJobs.xml"), None)
            .await
    }

    pub async fn job_payloads(&self, operation: &str) -> Result<Vec<String>> {
        let request = self
            .request(Method::Get, "job/payloads.json")
            .query("operation", operation);
        self.fetch(request, None).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let request = self.request(Method::Post, &format!("job/{}/cancel", id));
        self.fetch(request, Some(Missing::Job(id))).await
    }

    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        let request = self.request(Method::Delete, &format!("job/{}", id));
        self.call(request, 204, Some(Missing::Job(id)))
            .await
            .map(|_| ())
    }

    pub async fn remove_parentless_jobs(&self, lifetime_secs: u64) -> Result<()> {
        let request = self
            .request(Method::Post, "removeparentlessjobs")
            .field("lifetime", lifetime_secs);
        self.call(request, 204, None).await.map(|_| ())
    }

    // ========== Counts & load ==========

    pub async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let mut request = self.request(Method::Get, "count");
        if let Some(service_type) = &filter.service_type {
            request = request.query("serviceType", service_type);
        }
        if let Some(status) = filter.status {
            request = request.query("status", status);
        }
        if let Some(host) = &filter.host {
            request = request.query("host", host);
        }
        if let Some(operation) = &filter.operation {
            request = request.query("operation", operation);
        }
        let response = self.call(request, 200, None).await?;
        parse_count(&response.body)
    }

    pub async fn count_by_host(
        &self,
        service_type: &str,
        host: &str,
        status: JobStatus,
    ) -> Result<u64> {
        require("service type", service_type)?;
        require("host", host)?;
        self.count(&CountFilter {
            service_type: Some(service_type.to_string()),
            host: Some(host.to_string()),
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    pub async fn count_by_operation(
        &self,
        service_type: &str,
        operation: &str,
        status: JobStatus,
    ) -> Result<u64> {
        require("service type", service_type)?;
        require("operation", operation)?;
        self.count(&CountFilter {
            service_type: Some(service_type.to_string()),
            operation: Some(operation.to_string()),
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    pub async fn current_load(&self) -> Result<SystemLoad> {
        self.fetch(self.request(Method::Get, "currentload"), None)
            .await
    }

    /// Load factor of the host this client runs on.
    pub async fn own_load(&self) -> Result<f32> {
        let load = self.current_load().await?;
        load.get(&self.config.server_url)
            .map(NodeLoad::load_factor)
            .ok_or_else(|| DispatchError::HostNotFound(self.config.server_url.clone()))
    }

    pub async fn max_loads(&self) -> Result<SystemLoad> {
        self.fetch(self.request(Method::Get, "maxload"), None).await
    }

    pub async fn max_load_on_node(&self, host: &str) -> Result<NodeLoad> {
        let request = self.request(Method::Get, "maxload").query("host", host);
        let load: SystemLoad = self.fetch(request, Some(Missing::Host(host))).await?;
        load.get(host)
            .cloned()
            .ok_or_else(|| DispatchError::HostNotFound(host.to_string()))
    }
}

fn decode<R: DeserializeOwned>(body: &str) -> Result<R> {
    serde_json::from_str(body)
        .map_err(|e| DispatchError::transport(None, format!("undecodable response: {}", e)))
}

fn parse_count(body: &str) -> Result<u64> {
    body.trim()
        .parse()
        .map_err(|_| DispatchError::transport(None, format!("not a count: '{}'", body.trim())))
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DispatchError::InvalidArgument(format!(
            "{} must be provided",
            name
        )));
    }
    Ok(())
}
