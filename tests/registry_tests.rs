use fleet_dispatch::context::JobContext;
use fleet_dispatch::error::DispatchError;
use fleet_dispatch::registry::host::HostSpec;
use fleet_dispatch::registry::{DrainReport, ServiceRegistry};
use fleet_dispatch::scheduler::job::{JobStatus, JobUpdate, NewJob};

const COMPOSER: &str = "org.fleet.composer";
const INSPECTOR: &str = "org.fleet.inspector";

fn ctx() -> JobContext {
    JobContext::new("http://admin")
}

fn two_hosts() -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    for host in ["http://worker-1", "http://worker-2"] {
        registry.register_host(HostSpec::new(host, 4.0)).unwrap();
        registry
            .register_service(COMPOSER, host, "/composer", false)
            .unwrap();
    }
    registry
        .register_service(INSPECTOR, "http://worker-1", "/inspector", true)
        .unwrap();
    registry
}

// ========== Hosts ==========

#[test]
fn test_register_host_defaults() {
    let registry = ServiceRegistry::new();
    let host = registry
        .register_host(
            HostSpec::new("http://worker-1", 8.0)
                .with_address("10.0.0.1")
                .with_resources(16 << 30, 8),
        )
        .unwrap();

    assert!(host.online);
    assert!(!host.maintenance);
    assert!(host.accepts_jobs());
    assert_eq!(host.cores, 8);
    assert_eq!(host.address, "10.0.0.1");
}

#[test]
fn test_reregistering_host_keeps_maintenance() {
    let registry = ServiceRegistry::new();
    registry
        .register_host(HostSpec::new("http://worker-1", 4.0))
        .unwrap();
    registry.set_maintenance("http://worker-1", true).unwrap();
    registry.disable_host("http://worker-1").unwrap();

    let host = registry
        .register_host(HostSpec::new("http://worker-1", 6.0))
        .unwrap();
    assert!(host.maintenance);
    assert!(host.online);
    assert_eq!(host.max_load, 6.0);
    assert_eq!(registry.host_registrations().len(), 1);
}

#[test]
fn test_invalid_host_spec_rejected() {
    let registry = ServiceRegistry::new();
    assert!(registry.register_host(HostSpec::new(" ", 4.0)).is_err());
    assert!(registry
        .register_host(HostSpec::new("http://worker-1", -1.0))
        .is_err());
    assert!(registry.host_registrations().is_empty());
}

#[test]
fn test_unregister_idle_host() {
    let registry = two_hosts();
    let removed = registry.unregister_host("http://worker-1").unwrap();
    assert_eq!(removed.host, "http://worker-1");

    // Services go with the host.
    assert!(registry.services_by_host("http://worker-1").is_empty());
    assert!(registry.services_by_type(INSPECTOR).is_empty());
    assert_eq!(registry.services_by_type(COMPOSER).len(), 1);

    assert_eq!(
        registry.unregister_host("http://worker-1").unwrap_err(),
        DispatchError::HostNotFound("http://worker-1".to_string())
    );
}

#[test]
fn test_unregister_busy_host_rejected() {
    let registry = two_hosts();
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    registry.claim_job(job.id, "http://worker-1").unwrap();
    registry
        .update_job(job.id, JobUpdate::status(JobStatus::Running))
        .unwrap();

    let err = registry.unregister_host("http://worker-1").unwrap_err();
    assert_eq!(
        err,
        DispatchError::HostHasActiveJobs {
            host: "http://worker-1".to_string(),
            active: 1
        }
    );
    // Nothing was removed.
    assert!(registry.host_registration("http://worker-1").is_ok());
    assert_eq!(registry.services_by_host("http://worker-1").len(), 2);
}

#[test]
fn test_drain_then_unregister() {
    let registry = two_hosts();
    let running = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let dispatched = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "trim"))
        .unwrap();
    let elsewhere = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "mux"))
        .unwrap();
    registry.claim_job(running.id, "http://worker-1").unwrap();
    registry
        .update_job(running.id, JobUpdate::status(JobStatus::Running))
        .unwrap();
    registry.claim_job(dispatched.id, "http://worker-1").unwrap();
    registry.claim_job(elsewhere.id, "http://worker-2").unwrap();

    let report = registry.drain_host("http://worker-1").unwrap();
    assert_eq!(
        report,
        DrainReport {
            requeued: 1,
            failed: 1
        }
    );

    let running = registry.get_job(running.id).unwrap();
    assert_eq!(running.status, JobStatus::Failed);
    assert!(running.failure_reason.is_some());

    let dispatched = registry.get_job(dispatched.id).unwrap();
    assert_eq!(dispatched.status, JobStatus::Queued);
    assert!(dispatched.processing_host.is_none());

    // Other hosts are untouched.
    assert_eq!(
        registry.get_job(elsewhere.id).unwrap().status,
        JobStatus::Dispatched
    );

    registry.unregister_host("http://worker-1").unwrap();
}

#[test]
fn test_drain_unknown_host() {
    let registry = ServiceRegistry::new();
    assert!(registry.drain_host("http://nowhere").unwrap_err().is_not_found());
}

#[test]
fn test_enable_disable_host() {
    let registry = two_hosts();
    assert!(!registry.disable_host("http://worker-1").unwrap().online);
    assert!(registry.enable_host("http://worker-1").unwrap().online);
    assert!(registry.enable_host("http://nowhere").is_err());
}

// ========== Services ==========

#[test]
fn test_register_service_requires_host() {
    let registry = ServiceRegistry::new();
    assert_eq!(
        registry
            .register_service(COMPOSER, "http://nowhere", "/composer", false)
            .unwrap_err(),
        DispatchError::HostNotFound("http://nowhere".to_string())
    );
}

#[test]
fn test_register_service_requires_type() {
    let registry = two_hosts();
    assert!(matches!(
        registry.register_service("", "http://worker-1", "/x", false),
        Err(DispatchError::InvalidArgument(_))
    ));
}

#[test]
fn test_service_listings() {
    let registry = two_hosts();

    let by_host = registry.services_by_host("http://worker-1");
    let types: Vec<&str> = by_host.iter().map(|s| s.service_type.as_str()).collect();
    assert_eq!(types, vec![COMPOSER, INSPECTOR]);

    let by_type = registry.services_by_type(COMPOSER);
    let hosts: Vec<&str> = by_type.iter().map(|s| s.host.as_str()).collect();
    assert_eq!(hosts, vec!["http://worker-1", "http://worker-2"]);

    assert_eq!(registry.service_registrations().len(), 3);
}

#[test]
fn test_unregister_service() {
    let registry = two_hosts();
    registry
        .unregister_service(INSPECTOR, "http://worker-1")
        .unwrap();
    assert!(registry
        .service_registration(INSPECTOR, "http://worker-1")
        .unwrap_err()
        .is_not_found());
    assert!(registry
        .unregister_service(INSPECTOR, "http://worker-1")
        .is_err());
}

#[test]
fn test_set_service_online_returns_registration() {
    let registry = two_hosts();
    let offline = registry
        .set_service_online(COMPOSER, "http://worker-1", false)
        .unwrap();
    assert!(!offline.online);
    assert_eq!(offline.service_type, COMPOSER);
    assert_eq!(offline.host, "http://worker-1");
    assert!(
        !registry
            .service_registration(COMPOSER, "http://worker-1")
            .unwrap()
            .online
    );

    let online = registry
        .set_service_online(COMPOSER, "http://worker-1", true)
        .unwrap();
    assert!(online.online);
    assert!(registry
        .set_service_online(COMPOSER, "http://nowhere", true)
        .unwrap_err()
        .is_not_found());
}

// ========== Jobs ==========

#[test]
fn test_context_sets_creator_and_parent() {
    let registry = two_hosts();
    let parent = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "workflow"))
        .unwrap();
    assert_eq!(parent.creator_host, "http://admin");
    assert_eq!(parent.parent_id, None);

    let inner = JobContext::for_job("http://worker-1", parent.id);
    let child = registry
        .create_job(&inner, NewJob::new(COMPOSER, "encode"))
        .unwrap();
    assert_eq!(child.creator_host, "http://worker-1");
    assert_eq!(child.parent_id, Some(parent.id));

    let children = registry.child_jobs(parent.id).unwrap();
    assert_eq!(children.len(), 1);
}

#[test]
fn test_job_listings() {
    let registry = two_hosts();
    let a = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let b = registry
        .create_job(&ctx(), NewJob::new(INSPECTOR, "inspect"))
        .unwrap();
    let c = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "trim"))
        .unwrap();
    registry.claim_job(a.id, "http://worker-1").unwrap();
    registry.cancel_job(c.id).unwrap();

    assert_eq!(registry.jobs(Some(COMPOSER), None).len(), 2);
    assert_eq!(registry.jobs(None, Some(JobStatus::Canceled)).len(), 1);

    let active: Vec<u64> = registry.active_jobs().iter().map(|j| j.id).collect();
    assert_eq!(active, vec![a.id, b.id]);

    let queued: Vec<u64> = registry.queued_jobs().iter().map(|j| j.id).collect();
    assert_eq!(queued, vec![b.id]);
}

#[test]
fn test_cancel_job() {
    let registry = two_hosts();
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let canceled = registry.cancel_job(job.id).unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(canceled.date_completed.is_some());

    // Terminal jobs cannot be canceled again.
    assert!(registry.cancel_job(job.id).is_err());
    assert!(registry.cancel_job(12345).unwrap_err().is_not_found());
}

#[test]
fn test_remove_job_semantics() {
    let registry = two_hosts();
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();

    registry.remove_job(job.id).unwrap();
    registry.remove_job(job.id).unwrap();
    assert!(registry.get_job(job.id).unwrap_err().is_not_found());

    let next = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    assert!(next.id > job.id);
}

#[test]
fn test_remove_parentless_jobs() {
    let registry = two_hosts();
    let root = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "workflow"))
        .unwrap();
    registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode").with_parent(root.id))
        .unwrap();

    assert_eq!(registry.remove_parentless_jobs(chrono::Duration::days(1)), 0);
    assert_eq!(registry.remove_parentless_jobs(chrono::Duration::zero()), 2);
    assert!(registry.jobs(None, None).is_empty());
}

#[test]
fn test_job_payloads() {
    let registry = two_hosts();
    registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode").with_payload("<a/>"))
        .unwrap();
    registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "trim").with_payload("<b/>"))
        .unwrap();
    assert_eq!(registry.job_payloads("encode"), vec!["<a/>"]);
}

// ========== Counts & load ==========

#[test]
fn test_count_by_host_and_operation() {
    let registry = two_hosts();
    for op in ["encode", "encode", "trim"] {
        let job = registry
            .create_job(&ctx(), NewJob::new(COMPOSER, op))
            .unwrap();
        registry.claim_job(job.id, "http://worker-1").unwrap();
    }

    assert_eq!(
        registry
            .count_by_host(COMPOSER, "http://worker-1", JobStatus::Dispatched)
            .unwrap(),
        3
    );
    assert_eq!(
        registry
            .count_by_host(COMPOSER, "http://worker-2", JobStatus::Dispatched)
            .unwrap(),
        0
    );
    assert_eq!(
        registry
            .count_by_operation(COMPOSER, "encode", JobStatus::Dispatched)
            .unwrap(),
        2
    );
}

#[test]
fn test_count_requires_arguments() {
    let registry = two_hosts();
    assert!(matches!(
        registry.count_by_host(COMPOSER, "", JobStatus::Queued),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.count_by_host("", "http://worker-1", JobStatus::Queued),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.count_by_operation(COMPOSER, " ", JobStatus::Queued),
        Err(DispatchError::InvalidArgument(_))
    ));
}

#[test]
fn test_load_views() {
    let registry = two_hosts();
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode").with_load(1.5))
        .unwrap();
    registry.claim_job(job.id, "http://worker-2").unwrap();

    let current = registry.current_load();
    assert_eq!(current.len(), 2);
    assert_eq!(current.current_load("http://worker-2"), 1.5);
    assert_eq!(current.current_load("http://worker-1"), 0.0);

    let max = registry.max_loads();
    assert!(max.nodes().all(|n| n.current_load == 0.0 && n.max_load == 4.0));

    let node = registry.max_load_on_node("http://worker-2").unwrap();
    assert_eq!(node.max_load, 4.0);
    assert!(registry.max_load_on_node("http://nowhere").is_err());
}

#[test]
fn test_statistics() {
    let registry = two_hosts();
    let finished = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let running = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let dispatched = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();

    for job in [&finished, &running, &dispatched] {
        registry.claim_job(job.id, "http://worker-1").unwrap();
    }
    for job in [&finished, &running] {
        registry
            .update_job(job.id, JobUpdate::status(JobStatus::Running))
            .unwrap();
    }
    registry
        .update_job(finished.id, JobUpdate::status(JobStatus::Finished))
        .unwrap();

    let stats = registry.statistics();
    assert_eq!(stats.len(), 3);

    let composer = stats
        .iter()
        .find(|s| s.service.service_type == COMPOSER && s.service.host == "http://worker-1")
        .unwrap();
    assert_eq!(composer.finished_jobs, 1);
    assert_eq!(composer.running_jobs, 1);
    assert_eq!(composer.queued_jobs, 1);

    let idle = stats
        .iter()
        .find(|s| s.service.host == "http://worker-2")
        .unwrap();
    assert_eq!(idle.running_jobs + idle.queued_jobs + idle.finished_jobs, 0);
    assert_eq!(idle.mean_run_time_ms, 0);
}
