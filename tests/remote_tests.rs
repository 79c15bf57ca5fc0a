use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request},
    Router,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fleet_dispatch::api::{router, ApiState};
use fleet_dispatch::error::{DispatchError, Result};
use fleet_dispatch::registry::host::HostSpec;
use fleet_dispatch::registry::service::HealthState;
use fleet_dispatch::registry::ServiceRegistry;
use fleet_dispatch::remote::{
    Method, RemoteConfig, RemoteRegistry, RemoteRequest, RemoteResponse, Transport,
};
use fleet_dispatch::scheduler::job::{JobStatus, JobUpdate, NewJob};

const COMPOSER: &str = "org.fleet.composer";
const REGISTRY_URL: &str = "http://registry/services";

/// Returns scripted responses in order and records every request.
#[derive(Clone, Default)]
struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<RemoteResponse>>>,
    requests: Arc<Mutex<Vec<RemoteRequest>>>,
}

impl ScriptedTransport {
    fn respond(&self, status: u16, body: &str) {
        self.responses.lock().unwrap().push_back(RemoteResponse {
            status,
            body: body.to_string(),
        });
    }

    fn last_request(&self) -> RemoteRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DispatchError::transport(None, "connection refused"))
    }
}

/// Serves requests with the registry router, in process.
#[derive(Clone)]
struct LoopbackTransport {
    app: Router,
}

fn encode(pairs: &[(String, String)]) -> String {
    let mut url = reqwest::Url::parse("http://encoder/").unwrap();
    url.query_pairs_mut().extend_pairs(pairs);
    url.query().unwrap_or_default().to_string()
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let mut uri = request
            .url
            .strip_prefix(REGISTRY_URL)
            .unwrap_or(&request.url)
            .to_string();
        if !request.query.is_empty() {
            uri = format!("{}?{}", uri, encode(&request.query));
        }

        let builder = Request::builder()
            .method(request.method.to_string().as_str())
            .uri(uri);
        let http_request = match (&request.json, request.form.is_empty()) {
            (Some(json), _) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            (None, false) => builder
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(encode(&request.form))),
            (None, true) => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.app.clone().oneshot(http_request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        Ok(RemoteResponse {
            status,
            body: String::from_utf8(bytes.to_vec()).unwrap(),
        })
    }
}

fn scripted() -> (RemoteRegistry<ScriptedTransport>, ScriptedTransport) {
    let transport = ScriptedTransport::default();
    let client = RemoteRegistry::new(
        transport.clone(),
        RemoteConfig::new(REGISTRY_URL, "http://worker-1"),
    )
    .unwrap();
    (client, transport)
}

fn loopback() -> (RemoteRegistry<LoopbackTransport>, Arc<ServiceRegistry>) {
    let registry = Arc::new(ServiceRegistry::new());
    let app = router(ApiState {
        registry: registry.clone(),
        host_url: "http://registry".to_string(),
    });
    let client = RemoteRegistry::new(
        LoopbackTransport { app },
        RemoteConfig::new(REGISTRY_URL, "http://worker-1"),
    )
    .unwrap();
    (client, registry)
}

// ========== Status mapping ==========

#[test]
fn test_config_requires_http_url() {
    let config = RemoteConfig::new("registry:8080", "http://worker-1");
    assert!(matches!(
        RemoteRegistry::new(ScriptedTransport::default(), config),
        Err(DispatchError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_not_found_maps_to_domain_error() {
    let (client, transport) = scripted();

    transport.respond(404, "");
    assert_eq!(client.get_job(7).await.unwrap_err(), DispatchError::JobNotFound(7));

    transport.respond(404, "");
    assert_eq!(
        client.enable_host("http://worker-9").await.unwrap_err(),
        DispatchError::HostNotFound("http://worker-9".to_string())
    );

    transport.respond(404, "");
    assert!(matches!(
        client.sanitize(COMPOSER, "http://worker-9").await,
        Err(DispatchError::ServiceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_unexpected_status_is_transport_error() {
    let (client, transport) = scripted();

    transport.respond(500, "boom");
    match client.get_job(7).await {
        Err(DispatchError::Transport { status, .. }) => assert_eq!(status, Some(500)),
        other => panic!("unexpected result: {:?}", other),
    }

    // Success codes other than the expected one are unexpected too.
    transport.respond(200, "");
    assert!(matches!(
        client.remove_job(7).await,
        Err(DispatchError::Transport {
            status: Some(200),
            ..
        })
    ));

    // No response at all.
    assert!(matches!(
        client.active_jobs().await,
        Err(DispatchError::Transport { status: None, .. })
    ));
}

#[tokio::test]
async fn test_missing_service_registration_is_none() {
    let (client, transport) = scripted();
    transport.respond(404, "");
    assert_eq!(
        client
            .service_registration(COMPOSER, "http://worker-1")
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_undecodable_body_is_transport_error() {
    let (client, transport) = scripted();
    transport.respond(200, "<jobs/>");
    assert!(matches!(
        client.active_jobs().await,
        Err(DispatchError::Transport { status: None, .. })
    ));

    transport.respond(200, "many");
    assert!(client.count_of_abnormal_services().await.is_err());
}

#[tokio::test]
async fn test_create_job_request_shape() {
    let (client, transport) = scripted();
    transport.respond(500, "");

    let job = NewJob::new(COMPOSER, "encode")
        .with_arguments(["mp4", "720p"])
        .with_payload("<track/>")
        .with_parent(3);
    let _ = client.create_job(&job).await;

    let request = transport.last_request();
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.url, "http://registry/services/job");
    let field = |name: &str| -> Vec<&str> {
        request
            .form
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    };
    // No creator on the job: the client's own url is used.
    assert_eq!(field("host"), vec!["http://worker-1"]);
    assert_eq!(field("arg"), vec!["mp4", "720p"]);
    assert_eq!(field("start"), vec!["true"]);
    assert_eq!(field("parent"), vec!["3"]);
    assert_eq!(field("payload"), vec!["<track/>"]);
}

#[tokio::test]
async fn test_count_helpers_validate_locally() {
    let (client, transport) = scripted();
    assert!(matches!(
        client.count_by_host(COMPOSER, "", JobStatus::Running).await,
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(transport.requests.lock().unwrap().is_empty());
}

// ========== Against the real router ==========

#[tokio::test]
async fn test_remote_round_trip_through_router() {
    let (client, registry) = loopback();

    client
        .register_host(&HostSpec::new("http://worker-1", 4.0))
        .await
        .unwrap();
    let service = client
        .register_service(COMPOSER, "http://worker-1", "/composer", false)
        .await
        .unwrap();
    assert_eq!(service.health, HealthState::Normal);

    let job = client
        .create_job(&NewJob::new(COMPOSER, "encode").with_arguments(["mp4"]))
        .await
        .unwrap();
    assert_eq!(job.creator_host, "http://worker-1");
    assert_eq!(job.status, JobStatus::Queued);

    registry.claim_job(job.id, "http://worker-1").unwrap();
    client
        .update_job(job.id, &JobUpdate::status(JobStatus::Running))
        .await
        .unwrap();
    client
        .update_job(
            job.id,
            &JobUpdate::status(JobStatus::Finished).with_payload("<track/>"),
        )
        .await
        .unwrap();

    let fetched = client.get_job(job.id).await.unwrap();
    assert_eq!(fetched.status, JobStatus::Finished);
    assert_eq!(client.job_payloads("encode").await.unwrap(), vec!["<track/>"]);

    assert_eq!(
        client
            .count_by_host(COMPOSER, "http://worker-1", JobStatus::Finished)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        client
            .count_by_operation(COMPOSER, "encode", JobStatus::Finished)
            .await
            .unwrap(),
        1
    );

    let node = client.max_load_on_node("http://worker-1").await.unwrap();
    assert_eq!(node.max_load, 4.0);
    assert_eq!(client.own_load().await.unwrap(), 0.0);

    client.remove_job(job.id).await.unwrap();
    assert_eq!(
        client.get_job(job.id).await.unwrap_err(),
        DispatchError::JobNotFound(job.id)
    );
}

#[tokio::test]
async fn test_remote_host_management() {
    let (client, registry) = loopback();
    client
        .register_host(&HostSpec::new("http://worker-1", 2.0))
        .await
        .unwrap();
    client.set_maintenance("http://worker-1", true).await.unwrap();
    assert!(registry.host_registration("http://worker-1").unwrap().maintenance);

    client.disable_host("http://worker-1").await.unwrap();
    let hosts = client.host_registrations().await.unwrap();
    assert!(!hosts[0].online);

    client.unregister_host("http://worker-1").await.unwrap();
    assert!(client.host_registrations().await.unwrap().is_empty());
    assert_eq!(
        client.unregister_host("http://worker-1").await.unwrap_err(),
        DispatchError::HostNotFound("http://worker-1".to_string())
    );
}

#[tokio::test]
async fn test_remote_service_queries() {
    let (client, _) = loopback();
    client
        .register_host(&HostSpec::new("http://worker-1", 2.0))
        .await
        .unwrap();
    client
        .register_service(COMPOSER, "http://worker-1", "/composer", true)
        .await
        .unwrap();

    let service = client
        .service_registration(COMPOSER, "http://worker-1")
        .await
        .unwrap()
        .unwrap();
    assert!(service.job_producer);
    assert!(client
        .service_registration("org.fleet.unknown", "http://worker-1")
        .await
        .unwrap()
        .is_none());

    assert_eq!(client.services_by_type(COMPOSER).await.unwrap().len(), 1);
    assert_eq!(client.services_by_host("http://worker-1").await.unwrap().len(), 1);
    assert_eq!(client.services_by_load(COMPOSER).await.unwrap().len(), 1);
    assert_eq!(client.statistics().await.unwrap().len(), 1);
    assert_eq!(client.count_of_abnormal_services().await.unwrap(), 0);

    client
        .unregister_service(COMPOSER, "http://worker-1")
        .await
        .unwrap();
    assert!(client.service_registrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_cancel_and_cleanup() {
    let (client, _) = loopback();
    let parent = client
        .create_job(&NewJob::new(COMPOSER, "workflow"))
        .await
        .unwrap();
    let child = client
        .create_job(&NewJob::new(COMPOSER, "encode").with_parent(parent.id))
        .await
        .unwrap();

    assert_eq!(client.child_jobs(parent.id).await.unwrap()[0].id, child.id);
    assert_eq!(
        client.cancel_job(child.id).await.unwrap().status,
        JobStatus::Canceled
    );
    assert_eq!(
        client
            .jobs(COMPOSER, Some(JobStatus::Canceled))
            .await
            .unwrap()
            .len(),
        1
    );

    client.remove_parentless_jobs(0).await.unwrap();
    assert!(client.jobs(COMPOSER, None).await.unwrap().is_empty());
}
