use fleet_dispatch::context::JobContext;
use fleet_dispatch::error::DispatchError;
use fleet_dispatch::registry::host::HostSpec;
use fleet_dispatch::registry::ServiceRegistry;
use fleet_dispatch::scheduler::dispatcher::select_target;
use fleet_dispatch::scheduler::job::NewJob;
use proptest::prelude::*;

const COMPOSER: &str = "org.fleet.composer";

fn registry_with_hosts(hosts: &[(&str, f32)]) -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    for (host, max_load) in hosts {
        registry.register_host(HostSpec::new(*host, *max_load)).unwrap();
        registry
            .register_service(COMPOSER, host, "/composer", false)
            .unwrap();
    }
    registry
}

fn ctx() -> JobContext {
    JobContext::new("http://admin")
}

fn occupy(registry: &ServiceRegistry, host: &str, load: f32) {
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode").with_load(load))
        .unwrap();
    registry.claim_job(job.id, host).unwrap();
}

fn fail_on(registry: &ServiceRegistry, host: &str, operation: &str) {
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, operation))
        .unwrap();
    registry.record_dispatch_failure(&job, host).unwrap();
}

#[test]
fn test_least_loaded_host_wins() {
    let registry = registry_with_hosts(&[("http://a", 4.0), ("http://b", 4.0)]);
    occupy(&registry, "http://a", 2.0);

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://b");
    assert_eq!(target.service_type, COMPOSER);
    assert_eq!(target.service_path, "/composer");
}

#[test]
fn test_load_is_relative_to_capacity() {
    // 3 of 8 beats 1 of 2.
    let registry = registry_with_hosts(&[("http://small", 2.0), ("http://big", 8.0)]);
    occupy(&registry, "http://small", 1.0);
    occupy(&registry, "http://big", 3.0);

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://big");
}

#[test]
fn test_ties_broken_by_host_url() {
    let registry = registry_with_hosts(&[("http://c", 2.0), ("http://a", 2.0), ("http://b", 2.0)]);

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://a");
}

#[test]
fn test_maintenance_and_offline_hosts_skipped() {
    let registry = registry_with_hosts(&[
        ("http://a", 4.0),
        ("http://b", 4.0),
        ("http://c", 4.0),
    ]);
    occupy(&registry, "http://c", 3.0);
    registry.set_maintenance("http://a", true).unwrap();
    registry.disable_host("http://b").unwrap();

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://c");

    registry.set_maintenance("http://a", false).unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://a");
}

#[test]
fn test_offline_service_skipped() {
    let registry = registry_with_hosts(&[("http://a", 4.0), ("http://b", 4.0)]);
    registry.set_service_online(COMPOSER, "http://a", false).unwrap();

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://b");
}

#[test]
fn test_error_services_never_selected() {
    let registry = registry_with_hosts(&[("http://a", 100.0), ("http://b", 1.0)]);
    occupy(&registry, "http://b", 1.0);
    // Same signature twice: NORMAL -> WARNING -> ERROR.
    fail_on(&registry, "http://a", "encode");
    fail_on(&registry, "http://a", "encode");

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    // Overloaded but healthy beats idle but broken.
    assert_eq!(target.host, "http://b");
}

#[test]
fn test_normal_preferred_over_warning() {
    let registry = registry_with_hosts(&[("http://a", 10.0), ("http://b", 10.0)]);
    occupy(&registry, "http://b", 8.0);
    fail_on(&registry, "http://a", "trim");

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    let target = select_target(&job, &registry.dispatch_snapshot()).unwrap();
    assert_eq!(target.host, "http://b");
}

#[test]
fn test_warning_host_used_when_only_option() {
    let registry = registry_with_hosts(&[("http://a", 10.0)]);
    fail_on(&registry, "http://a", "trim");

    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    assert!(select_target(&job, &registry.dispatch_snapshot()).is_ok());
}

#[test]
fn test_no_eligible_host() {
    let registry = registry_with_hosts(&[("http://a", 4.0)]);
    let job = registry
        .create_job(&ctx(), NewJob::new("org.fleet.inspector", "inspect"))
        .unwrap();

    assert_eq!(
        select_target(&job, &registry.dispatch_snapshot()).unwrap_err(),
        DispatchError::NoEligibleHost("org.fleet.inspector".to_string())
    );

    registry.disable_host("http://a").unwrap();
    let job = registry
        .create_job(&ctx(), NewJob::new(COMPOSER, "encode"))
        .unwrap();
    assert!(matches!(
        select_target(&job, &registry.dispatch_snapshot()),
        Err(DispatchError::NoEligibleHost(_))
    ));
}

#[test]
fn test_services_by_load_ordering() {
    let registry = registry_with_hosts(&[("http://a", 4.0), ("http://b", 4.0), ("http://c", 4.0)]);
    occupy(&registry, "http://a", 3.0);
    occupy(&registry, "http://b", 1.0);
    registry.set_maintenance("http://c", true).unwrap();

    let hosts: Vec<String> = registry
        .services_by_load(COMPOSER)
        .into_iter()
        .map(|s| s.host)
        .collect();
    assert_eq!(hosts, vec!["http://b", "http://a"]);
}

proptest! {
    #[test]
    fn prop_selected_host_has_minimal_projected_load(
        hosts in prop::collection::vec((1u8..=16, 0u8..=16), 1..6),
        job_load in 0u8..=4,
    ) {
        let names: Vec<String> = (0..hosts.len()).map(|i| format!("http://host-{}", i)).collect();
        let specs: Vec<(&str, f32)> = names
            .iter()
            .zip(&hosts)
            .map(|(name, (max, _))| (name.as_str(), *max as f32))
            .collect();
        let registry = registry_with_hosts(&specs);
        for (name, (_, busy)) in names.iter().zip(&hosts) {
            if *busy > 0 {
                occupy(&registry, name, *busy as f32);
            }
        }

        let job = registry
            .create_job(&ctx(), NewJob::new(COMPOSER, "encode").with_load(job_load as f32))
            .unwrap();
        let snapshot = registry.dispatch_snapshot();
        let target = select_target(&job, &snapshot).unwrap();

        let projected = |host: &str| {
            snapshot.load.get(host).unwrap().projected_load_factor(job.job_load)
        };
        let chosen = projected(&target.host);
        for name in &names {
            prop_assert!(chosen <= projected(name));
        }
    }
}
