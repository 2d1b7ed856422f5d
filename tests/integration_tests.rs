use kubestack::error::ReferenceFailure;
use kubestack::graph::DependencyGraph;
use kubestack::prelude::*;
use kubestack::resource::reference::OutputRef;
use kubestack::runner::summary::{AccessOutcome, PreviousState};
use kubestack::runner::testkit::{self, InMemoryControlPlane, RemoteEvent};

use kubestack::access::BindOutcome;
use kubestack::remote::{ApplyAction, RemoteId};
use kubestack::serde_json::{json, Value};

use std::collections::BTreeSet;
use std::time::Duration;

fn setup() {
    std::env::set_var("RUST_LOG", "kubestack=trace");
    let _ = env_logger::try_init();
}

fn stack_config(variant: &str, extra: &str) -> StackConfig {
    let yaml = format!(
        r#"
name: nn-kube
variant: {}
accountId: "123456789012"
region: us-west-1
containers:
  - name: noticeninja-auth
    port: 3001
  - name: noticeninja-api
    port: 3002
admins:
  - principal: KubeAdmin
{}
"#,
        variant, extra
    );
    StackConfig::from_yaml_str(&yaml).expect("failed to parse stack config")
}

fn plan(variant: &str) -> StackPlan {
    build_stack(&stack_config(variant, "")).expect("failed to build stack")
}

fn subnets(name: &str) -> ResourceDescriptor {
    let config = json!({
        "groupName": name,
        "description": "subnets for tests",
        "subnetIds": ["subnet-1a"],
    });
    ResourceDescriptor::new(ResourceKind::CacheSubnetGroup, name)
        .with_raw_config(config.as_object().cloned().unwrap())
}

fn output(control_plane: &InMemoryControlPlane, name: &str, output: &str) -> Value {
    let outputs = control_plane
        .outputs_of(name)
        .unwrap_or_else(|| panic!("resource '{}' does not exist", name));
    outputs[output].clone()
}

async fn wait_for_first_ensure(control_plane: &InMemoryControlPlane) {
    for _ in 0..1000 {
        if control_plane.ensure_calls() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("no resource was ensured within one second");
}

#[tokio::test]
async fn full_stack_is_provisioned_with_resolved_cross_references() {
    setup();
    let control_plane = InMemoryControlPlane::new().ready_after("cluster", 3);
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let summary = provisioner
        .provision(plan("withCache"))
        .await
        .expect("provisioning failed");

    assert!(summary.is_success(), "run was not successful: {:?}", summary);
    assert_eq!(8, summary.applied.len());
    assert_eq!("cluster", summary.applied[0]);
    assert_eq!(8, summary.created_count());

    let cache_config = control_plane.config_of("cache").expect("cache was not created");
    assert_eq!(output(&control_plane, "cacheSubnetGroup", "id"), cache_config["subnetGroupRef"]);
    assert_eq!(
        json!([output(&control_plane, "cacheSecurityGroup", "id")]),
        cache_config["securityGroupRefs"]
    );
    let security_group = control_plane.config_of("cacheSecurityGroup").unwrap();
    assert_eq!(output(&control_plane, "cluster", "vpcId"), security_group["vpcId"]);
    assert_eq!(
        output(&control_plane, "cluster", "securityGroupId"),
        security_group["ingress"][0]["sourceSecurityGroup"]
    );
    let subnet_group = control_plane.config_of("cacheSubnetGroup").unwrap();
    assert!(subnet_group["subnetIds"].is_array());
    assert_eq!(json!("nn-kube-cluster"), control_plane.config_of("nodePool").unwrap()["clusterName"]);

    let record = summary.record("cache").expect("missing apply record");
    assert_eq!(ApplyAction::Created, record.action);
    assert_eq!(PreviousState::Absent, record.previous_state);
    assert_eq!(ResourceKind::Cache, record.kind);

    assert_eq!(
        Some(&json!("https://nn-kube-cluster.eks.local")),
        summary.outputs.get("clusterEndpoint")
    );
    assert_eq!(Some(&json!("service.elb.local")), summary.outputs.get("serviceHostname"));

    let deployment = control_plane.manifest_of("workload").expect("workload has no manifest");
    assert_eq!(json!("apps/v1"), deployment["apiVersion"]);
    assert_eq!(json!("Deployment"), deployment["kind"]);
    assert_eq!(json!({ "app": "nn-kube" }), deployment["spec"]["selector"]["matchLabels"]);
    let service = control_plane.manifest_of("service").expect("service has no manifest");
    assert_eq!(json!("Service"), service["kind"]);
    assert_eq!(json!(3001), service["spec"]["ports"][0]["targetPort"]);
    assert!(control_plane.manifest_of("cache").is_none());
    assert_eq!(
        Some(&json!("nn-kube-cache.cache.local:6379")),
        summary.outputs.get("cacheEndpoint")
    );
    assert_eq!(0, provisioner.metrics().in_flight());
}

#[tokio::test]
async fn no_resource_is_ensured_before_its_dependencies_are_ready() {
    setup();
    let control_plane = InMemoryControlPlane::new()
        .with_default_polls(2)
        .ready_after("cacheSubnetGroup", 6);
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let plan = plan("withCache");
    let graph = DependencyGraph::build(plan.descriptors.clone()).expect("invalid graph");

    let summary = provisioner.provision(plan).await.expect("provisioning failed");
    assert!(summary.is_success());

    let events = control_plane.events();
    let position = |expected: &RemoteEvent| {
        events
            .iter()
            .position(|e| e == expected)
            .unwrap_or_else(|| panic!("missing event: {:?}", expected))
    };
    for descriptor in graph.order() {
        let ensured = position(&RemoteEvent::Ensured {
            name: descriptor.name.clone(),
            action: ApplyAction::Created,
        });
        for dependency in graph.dependencies(&descriptor.name) {
            let ready = position(&RemoteEvent::Ready {
                name: dependency.to_owned(),
            });
            assert!(
                ready < ensured,
                "'{}' was ensured before its dependency '{}' was ready",
                descriptor.name,
                dependency
            );
        }
    }
    let bound = position(&RemoteEvent::Bound {
        principal: "KubeAdmin".to_owned(),
    });
    assert!(position(&RemoteEvent::Ready { name: "cluster".to_owned() }) < bound);
}

#[tokio::test]
async fn second_run_leaves_existing_resources_unchanged() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let first = provisioner.provision(plan("withCache")).await.expect("first run failed");
    assert_eq!(8, control_plane.creations());
    let ensure_calls = control_plane.ensure_calls();

    let second = provisioner.provision(plan("withCache")).await.expect("second run failed");
    assert!(second.is_success());
    assert_eq!(8, control_plane.creations());
    assert_eq!(0, control_plane.updates());
    assert_eq!(ensure_calls, control_plane.ensure_calls());
    assert_eq!(0, second.created_count());
    assert!(second.records.iter().all(|r| r.action == ApplyAction::Unchanged));
    assert_eq!(first.outputs, second.outputs);
    assert_eq!(
        Some(&AccessOutcome::Bound {
            result: BindOutcome::Unchanged
        }),
        second.access_outcome("KubeAdmin")
    );
    assert_eq!(1, control_plane.binding_writes());
}

#[tokio::test]
async fn changed_configuration_is_updated_in_place() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    provisioner.provision(plan("withCache")).await.expect("first run failed");

    let scaled = build_stack(&stack_config("withCache", "replicas: 5")).expect("failed to build stack");
    let summary = provisioner.provision(scaled).await.expect("second run failed");

    assert!(summary.is_success());
    assert_eq!(8, control_plane.creations());
    assert_eq!(1, control_plane.updates());
    assert_eq!(ApplyAction::Updated, summary.record("workload").unwrap().action);
    assert_eq!(
        PreviousState::Existing(kubestack::remote::ResourceStatus::Ready),
        summary.record("workload").unwrap().previous_state
    );
    assert_eq!(json!(5), control_plane.config_of("workload").unwrap()["replicas"]);
}

#[tokio::test]
async fn downgrading_the_variant_removes_containers_from_the_workload() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    provisioner.provision(plan("multiContainer")).await.expect("first run failed");
    assert_eq!(2, control_plane.config_of("workload").unwrap()["containers"].as_array().unwrap().len());

    let summary = provisioner.provision(plan("initial")).await.expect("second run failed");

    assert!(summary.is_success());
    assert_eq!(ApplyAction::Updated, summary.record("workload").unwrap().action);
    assert_eq!(ApplyAction::Updated, summary.record("nodePool").unwrap().action);
    assert_eq!(ApplyAction::Unchanged, summary.record("cluster").unwrap().action);
    let containers = control_plane.config_of("workload").unwrap()["containers"].clone();
    assert_eq!(1, containers.as_array().unwrap().len());
    assert_eq!(json!("noticeninja-auth"), containers[0]["name"]);
    let manifest = control_plane.manifest_of("workload").expect("workload has no manifest");
    assert_eq!(
        1,
        manifest["spec"]["template"]["spec"]["containers"].as_array().unwrap().len()
    );
}

#[tokio::test]
async fn disabling_the_injected_endpoint_removes_it_from_the_workload() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let injected = stack_config("withCache", "cache:\n  injectEndpoint: true\n");
    provisioner
        .provision(build_stack(&injected).expect("failed to build stack"))
        .await
        .expect("first run failed");

    let summary = provisioner.provision(plan("withCache")).await.expect("second run failed");

    assert!(summary.is_success());
    assert_eq!(ApplyAction::Updated, summary.record("workload").unwrap().action);
    assert_eq!(1, control_plane.updates());
    let workload = control_plane.config_of("workload").unwrap();
    for container in workload["containers"].as_array().unwrap() {
        assert_eq!(json!([]), container["env"]);
    }
    let manifest = control_plane.manifest_of("workload").unwrap();
    for container in manifest["spec"]["template"]["spec"]["containers"].as_array().unwrap() {
        assert!(container.get("env").is_none(), "stale env in manifest: {}", container);
    }
}

#[tokio::test]
async fn failure_skips_dependents_and_lets_siblings_proceed() {
    setup();
    let control_plane = InMemoryControlPlane::new().reject_ensure("workload", "quota exceeded");
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let summary = provisioner
        .provision(plan("withCache"))
        .await
        .expect("a failed resource must not abort the run");

    assert_eq!(
        Some(&FailureReason::remote("ensure of 'workload' was rejected: quota exceeded")),
        summary.failure("workload")
    );
    assert_eq!(vec!["service", "service-noticeninja-api"], summary.skipped);
    for sibling in &["cluster", "nodePool", "cacheSubnetGroup", "cacheSecurityGroup", "cache"] {
        assert!(
            summary.applied.iter().any(|a| a == sibling),
            "expected '{}' to be applied",
            sibling
        );
    }
    assert!(control_plane.config_of("service").is_none());
    assert!(!summary.outputs.contains_key("serviceHostname"));
    assert!(summary.outputs.contains_key("cacheEndpoint"));
    assert!(!summary.is_success());
    assert_eq!(1, provisioner.metrics().failure_count(ResourceKind::Workload));
}

#[tokio::test]
async fn resource_that_never_becomes_ready_times_out() {
    setup();
    let control_plane = InMemoryControlPlane::new().never_ready("cache");
    let config = testkit::fast_config().with_timeout(ResourceKind::Cache, Duration::from_millis(100));
    let provisioner = Provisioner::new(config, control_plane.clone());

    let summary = provisioner.provision(plan("withCache")).await.expect("provisioning failed");

    assert_eq!(
        Some(&FailureReason::Timeout { after_ms: 100 }),
        summary.failure("cache")
    );
    assert_eq!(7, summary.applied.len());
    assert!(summary.skipped.is_empty());
    assert!(!summary.outputs.contains_key("cacheEndpoint"));
    assert!(summary.outputs.contains_key("serviceHostname"));
}

#[tokio::test]
async fn failed_status_is_reported_with_the_remote_message() {
    setup();
    let control_plane = InMemoryControlPlane::new().fail_on_status("cluster", "insufficient capacity");
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let summary = provisioner.provision(plan("initial")).await.expect("provisioning failed");

    assert_eq!(
        Some(&FailureReason::remote("insufficient capacity")),
        summary.failure("cluster")
    );
    assert!(summary.applied.is_empty());
    assert_eq!(vec!["nodePool", "workload", "service"], summary.skipped);
    assert_eq!(Some(&AccessOutcome::Skipped), summary.access_outcome("KubeAdmin"));
    assert_eq!(1, control_plane.ensure_calls());
}

#[tokio::test]
async fn temporarily_unavailable_status_is_treated_as_pending() {
    setup();
    let control_plane = InMemoryControlPlane::new()
        .ready_after("cluster", 2)
        .status_unavailable("cluster", 3);
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let summary = provisioner.provision(plan("initial")).await.expect("provisioning failed");

    assert!(summary.is_success());
    let metrics = String::from_utf8(provisioner.metrics().encode_as_text().unwrap()).unwrap();
    assert!(
        metrics.contains("kubestack_status_polls_unavailable 3"),
        "unexpected metrics: {}",
        metrics
    );
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    setup();
    let control_plane = InMemoryControlPlane::new()
        .with_default_polls(3)
        .with_latency(Duration::from_millis(10));
    let config = testkit::fast_config().with_concurrency_limit(2);
    let provisioner = Provisioner::new(config, control_plane.clone());
    let plan = (0..6).fold(StackPlan::new(), |plan, i| {
        plan.with_resource(subnets(&format!("subnets{}", i)))
    });

    let summary = provisioner.provision(plan).await.expect("provisioning failed");

    assert_eq!(6, summary.applied.len());
    assert!(
        control_plane.max_in_flight() <= 2,
        "{} resources were applied concurrently",
        control_plane.max_in_flight()
    );
    assert!(control_plane.max_in_flight() >= 1);
}

#[tokio::test]
async fn independent_branches_are_applied_concurrently() {
    setup();
    let control_plane = InMemoryControlPlane::new().with_default_polls(4);
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let plan = StackPlan::new()
        .with_resource(subnets("left"))
        .with_resource(subnets("right"));

    let summary = provisioner.provision(plan).await.expect("provisioning failed");

    assert_eq!(vec!["left", "right"], {
        let mut applied = summary.applied.clone();
        applied.sort();
        applied
    });
    assert_eq!(2, control_plane.max_in_flight());
}

#[tokio::test]
async fn cancel_with_drain_waits_for_in_flight_applies() {
    setup();
    let control_plane = InMemoryControlPlane::new().ready_after("cluster", 20);
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let (handle, join_handle) = provisioner.start(plan("initial"));
    wait_for_first_ensure(&control_plane).await;
    handle.cancel(CancelMode::Drain);
    assert!(handle.is_cancelled());

    let summary = join_handle.await.expect("run panicked").expect("run failed");
    assert_eq!(vec!["cluster"], summary.applied);
    assert_eq!(vec!["nodePool", "workload", "service"], summary.skipped);
    assert!(summary.abandoned.is_empty());
    assert_eq!(Some(&AccessOutcome::Skipped), summary.access_outcome("KubeAdmin"));
    assert_eq!(1, control_plane.ensure_calls());
}

#[tokio::test]
async fn cancel_with_abandon_stops_waiting_for_in_flight_applies() {
    setup();
    let control_plane = InMemoryControlPlane::new().never_ready("cluster");
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let (handle, join_handle) = provisioner.start(plan("initial"));
    wait_for_first_ensure(&control_plane).await;
    handle.cancel(CancelMode::Abandon);

    let summary = tokio::time::timeout(Duration::from_secs(2), join_handle)
        .await
        .expect("abandoning the run took too long")
        .expect("run panicked")
        .expect("run failed");
    assert!(summary.applied.is_empty());
    assert_eq!(vec!["cluster"], summary.abandoned);
    assert_eq!(vec!["nodePool", "workload", "service"], summary.skipped);
    assert_eq!(0, provisioner.metrics().in_flight());
}

#[tokio::test]
async fn invalid_plan_is_rejected_before_any_remote_call() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let config = stack_config(
        "initial",
        "nodePool:\n  minSize: 5\n  desiredSize: 2\n  maxSize: 4\n",
    );
    let plan = build_stack(&config).expect("failed to build stack");

    let err = provisioner.provision(plan).await.expect_err("expected a validation error");

    assert!(err.is_validation(), "unexpected error: {}", err);
    assert_eq!(1, err.validation_errors().len());
    assert_eq!("nodePool", err.validation_errors()[0].subject());
    assert_eq!(0, control_plane.ensure_calls());
}

#[tokio::test]
async fn dependency_cycle_is_rejected_before_any_remote_call() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let plan = StackPlan::new()
        .with_resource(subnets("a").depends_on("b"))
        .with_resource(subnets("b").depends_on("a"));

    let err = provisioner.provision(plan).await.expect_err("expected a cycle");

    assert_eq!(
        ProvisionError::CycleDetected {
            cycle: vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]
        },
        err
    );
    assert_eq!(0, control_plane.ensure_calls());
}

#[tokio::test]
async fn access_bindings_are_applied_once_the_cluster_exists() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let plan = plan("initial").with_access_binding(AccessBinding::new(
        "Viewer",
        "cluster",
        vec!["view"],
    ));

    let summary = provisioner.provision(plan).await.expect("provisioning failed");

    assert_eq!(
        Some(&AccessOutcome::Bound {
            result: BindOutcome::Created
        }),
        summary.access_outcome("KubeAdmin")
    );
    let cluster_id = output(&control_plane, "cluster", "id");
    let cluster_id = RemoteId::new(cluster_id.as_str().unwrap());
    let expected: BTreeSet<String> = vec!["system:masters".to_owned()].into_iter().collect();
    assert_eq!(Some(expected), control_plane.binding(&cluster_id, "KubeAdmin"));
    assert_eq!(2, control_plane.binding_writes());
}

#[tokio::test]
async fn injected_cache_endpoint_reaches_every_container() {
    setup();
    let control_plane = InMemoryControlPlane::new();
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
    let config = stack_config("withCache", "cache:\n  injectEndpoint: true\n");

    let summary = provisioner
        .provision(build_stack(&config).expect("failed to build stack"))
        .await
        .expect("provisioning failed");

    assert!(summary.is_success());
    let workload = control_plane.config_of("workload").unwrap();
    for container in workload["containers"].as_array().unwrap() {
        assert_eq!(
            json!([{ "name": "CACHE_ENDPOINT", "value": "nn-kube-cache.cache.local:6379" }]),
            container["env"]
        );
    }
    let position = |name: &str| summary.applied.iter().position(|a| a == name).unwrap();
    assert!(position("cache") < position("workload"));
}

#[tokio::test]
async fn missing_output_aborts_the_run() {
    setup();
    let control_plane = InMemoryControlPlane::new().withhold_output("cluster", "vpcId");
    let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());

    let err = provisioner
        .provision(plan("withCache"))
        .await
        .expect_err("expected an unresolved reference");

    assert_eq!(
        ProvisionError::UnresolvedReference {
            resource: "cacheSecurityGroup".to_owned(),
            reference: OutputRef::new("cluster", "vpcId"),
            reason: ReferenceFailure::MissingOutput,
        },
        err
    );
    assert!(control_plane.config_of("cacheSecurityGroup").is_none());
    assert!(control_plane.config_of("cache").is_none());
}
