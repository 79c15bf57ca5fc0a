//! HTTP endpoints of the registry.
//!
//! Requests carry url-encoded forms (POST) or query strings (GET), responses
//! are JSON except for counts, which are plain integers. The `.xml`
//! suffixes of the paths are kept for compatibility; bodies are JSON.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Form, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::JobContext;
use crate::error::DispatchError;
use crate::registry::{HostSpec, ServiceRegistry};
use crate::scheduler::job::{JobId, JobStatus, JobUpdate, NewJob, DEFAULT_JOB_LOAD};
use crate::scheduler::load::SystemLoad;
use crate::scheduler::store::CountFilter;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ServiceRegistry>,
    /// Creator host of jobs submitted without one.
    pub host_url: String,
}

/// Domain error rendered as an HTTP status with a JSON message.
#[derive(Debug)]
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::JobNotFound(_)
            | DispatchError::HostNotFound(_)
            | DispatchError::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::IllegalTransition { .. }
            | DispatchError::AlreadyClaimed(_)
            | DispatchError::HostHasActiveJobs { .. }
            | DispatchError::JobRunning(_) => StatusCode::CONFLICT,
            DispatchError::InvalidArgument(_) | DispatchError::Configuration(_) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::CapacityExceeded(_) | DispatchError::NoEligibleHost(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Transport { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::JobFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Decoded form or query parameters. Keys may repeat (`arg`).
struct Params(Vec<(String, String)>);

impl Params {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == name && !v.trim().is_empty())
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn required(&self, name: &str) -> ApiResult<&str> {
        self.get(name).ok_or_else(|| {
            DispatchError::InvalidArgument(format!("parameter '{}' is required", name)).into()
        })
    }

    fn parse<T: FromStr>(&self, name: &str) -> ApiResult<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                DispatchError::InvalidArgument(format!(
                    "parameter '{}' is malformed: {}",
                    name, raw
                ))
                .into()
            }),
        }
    }

    fn status(&self) -> ApiResult<Option<JobStatus>> {
        self.get("status")
            .map(JobStatus::from_str)
            .transpose()
            .map_err(ApiError::from)
    }
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    let id = raw
        .strip_suffix(".xml")
        .or_else(|| raw.strip_suffix(".json"))
        .unwrap_or(raw);
    id.parse()
        .map_err(|_| DispatchError::InvalidArgument(format!("'{}' is not a job id", raw)).into())
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // hosts
        .route("/registerhost", post(register_host))
        .route("/unregisterhost", post(unregister_host))
        .route("/enablehost", post(enable_host))
        .route("/disablehost", post(disable_host))
        .route("/maintenance", post(set_maintenance))
        .route("/hosts.xml", get(hosts))
        // services
        .route("/register", post(register_service))
        .route("/unregister", post(unregister_service))
        .route("/services.xml", get(services))
        .route("/available.xml", get(available))
        .route("/statistics.xml", get(statistics))
        .route("/sanitize", post(sanitize))
        .route("/servicewarnings", get(service_warnings))
        // jobs
        .route("/job", post(create_job))
        .route("/job/payloads.json", get(job_payloads))
        .route(
            "/job/:id",
            get(get_job).put(update_job).delete(remove_job),
        )
        .route("/job/:id/children.xml", get(child_jobs))
        .route("/job/:id/cancel", post(cancel_job))
        .route("/jobs.xml", get(jobs))
        .route("/activeJobs.xml", get(active_jobs))
        .route("/removeparentlessjobs", post(remove_parentless_jobs))
        // counts & load
        .route("/count", get(count))
        .route("/currentload", get(current_load))
        .route("/maxload", get(max_load))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Registry API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ========== Hosts ==========

async fn register_host(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    let max_load = params.parse::<f32>("maxLoad")?.unwrap_or(1.0);
    let spec = HostSpec::new(params.required("host")?, max_load)
        .with_address(params.get("address").unwrap_or_default())
        .with_resources(
            params.parse("memory")?.unwrap_or(0),
            params.parse("cores")?.unwrap_or(1),
        );
    state.registry.register_host(spec)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unregister_host(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    state.registry.unregister_host(params.required("host")?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_host(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    state.registry.enable_host(params.required("host")?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_host(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    state.registry.disable_host(params.required("host")?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_maintenance(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    let maintenance = params.parse::<bool>("maintenance")?.ok_or_else(|| {
        ApiError::from(DispatchError::InvalidArgument(
            "parameter 'maintenance' is required".to_string(),
        ))
    })?;
    state
        .registry
        .set_maintenance(params.required("host")?, maintenance)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hosts(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.host_registrations())
}

// ========== Services ==========

async fn register_service(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    let registration = state.registry.register_service(
        params.required("serviceType")?,
        params.required("host")?,
        params.get("path").unwrap_or_default(),
        params.parse("jobProducer")?.unwrap_or(false),
    )?;
    Ok(Json(registration))
}

async fn unregister_service(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    state
        .registry
        .unregister_service(params.required("serviceType")?, params.required("host")?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn services(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let params = Params(params);
    let registry = &state.registry;
    let response = match (params.get("serviceType"), params.get("host")) {
        (Some(service_type), Some(host)) => {
            Json(registry.service_registration(service_type, host)?).into_response()
        }
        (Some(service_type), None) => Json(registry.services_by_type(service_type)).into_response(),
        (None, Some(host)) => Json(registry.services_by_host(host)).into_response(),
        (None, None) => Json(registry.service_registrations()).into_response(),
    };
    Ok(response)
}

async fn available(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    let service_type = params.required("serviceType")?;
    Ok(Json(state.registry.services_by_load(service_type)))
}

async fn statistics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.statistics())
}

async fn sanitize(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    state
        .registry
        .sanitize(params.required("serviceType")?, params.required("host")?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn service_warnings(State(state): State<ApiState>) -> impl IntoResponse {
    state.registry.count_of_abnormal_services().to_string()
}

// ========== Jobs ==========

async fn create_job(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    let creator = params.get("host").unwrap_or(state.host_url.as_str());
    let context = JobContext::new(creator);

    let mut request = NewJob::new(params.required("jobType")?, params.required("operation")?)
        .with_arguments(params.all("arg"))
        .with_load(params.parse("jobLoad")?.unwrap_or(DEFAULT_JOB_LOAD));
    if let Some(payload) = params.get("payload") {
        request = request.with_payload(payload);
    }
    if let Some(parent) = params.parse::<JobId>("parent")? {
        request = request.with_parent(parent);
    }
    if !params.parse::<bool>("start")?.unwrap_or(true) {
        request = request.inline();
    }

    let job = state.registry.create_job(&context, request)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.get_job(parse_job_id(&id)?)?))
}

async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<JobUpdate>,
) -> ApiResult<StatusCode> {
    state.registry.update_job(parse_job_id(&id)?, update)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.remove_job(parse_job_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn child_jobs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.child_jobs(parse_job_id(&id)?)?))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.cancel_job(parse_job_id(&id)?)?))
}

async fn job_payloads(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    Ok(Json(state.registry.job_payloads(params.required("operation")?)))
}

async fn jobs(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    let status = params.status()?;
    Ok(Json(state.registry.jobs(params.get("serviceType"), status)))
}

async fn active_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.active_jobs())
}

async fn remove_parentless_jobs(
    State(state): State<ApiState>,
    Form(params): Form<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let params = Params(params);
    let lifetime = params.parse::<i64>("lifetime")?.ok_or_else(|| {
        ApiError::from(DispatchError::InvalidArgument(
            "parameter 'lifetime' is required".to_string(),
        ))
    })?;
    if lifetime < 0 {
        return Err(
            DispatchError::InvalidArgument("lifetime must not be negative".to_string()).into(),
        );
    }
    // A lifetime too long to express leaves nothing old enough to remove.
    if let Some(lifetime) = chrono::Duration::try_seconds(lifetime) {
        state.registry.remove_parentless_jobs(lifetime);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ========== Counts & load ==========

async fn count(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<String> {
    let params = Params(params);
    let filter = CountFilter {
        service_type: params.get("serviceType").map(str::to_string),
        host: params.get("host").map(str::to_string),
        operation: params.get("operation").map(str::to_string),
        status: params.status()?,
    };
    Ok(state.registry.count(&filter).to_string())
}

async fn current_load(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.current_load())
}

async fn max_load(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let params = Params(params);
    let load = match params.get("host") {
        Some(host) => {
            let mut load = SystemLoad::new();
            load.insert(state.registry.max_load_on_node(host)?);
            load
        }
        None => state.registry.max_loads(),
    };
    Ok(Json(load))
}
