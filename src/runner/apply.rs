use crate::config::BackoffConfig;
use crate::error::FailureReason;
use crate::remote::{ApplyAction, ControlPlane, RemoteId, ResourceSpec, ResourceStatus};
use crate::runner::compare::compare_values;
use crate::runner::duration_to_millis;
use crate::runner::metrics::Metrics;
use crate::runner::summary::PreviousState;

use backoff::backoff::Backoff;
use serde_json::Value;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a worker needs to apply a single resource
#[derive(Debug, Clone)]
pub(crate) struct ApplyTask {
    pub index: usize,
    pub spec: ResourceSpec,
    pub timeout: Duration,
    pub poll_backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AppliedResource {
    pub id: RemoteId,
    pub action: ApplyAction,
    pub previous_state: PreviousState,
    pub status: ResourceStatus,
    pub outputs: Value,
    pub duration: Duration,
}

/// Applies the resource and waits for it to become ready, bounded by the timeout of the task.
pub(crate) async fn apply_resource(
    control_plane: Arc<dyn ControlPlane>,
    metrics: Arc<Metrics>,
    task: ApplyTask,
) -> Result<AppliedResource, FailureReason> {
    let start_time = Instant::now();
    let timeout = task.timeout;
    let result = tokio::time::timeout(timeout, apply_and_wait(&*control_plane, &*metrics, &task)).await;
    match result {
        Ok(Ok(mut applied)) => {
            applied.duration = start_time.elapsed();
            Ok(applied)
        }
        Ok(Err(reason)) => Err(reason),
        Err(_) => {
            log::warn!(
                "Resource '{}' did not become ready within {}ms",
                task.spec.name,
                duration_to_millis(timeout)
            );
            Err(FailureReason::Timeout {
                after_ms: duration_to_millis(timeout),
            })
        }
    }
}

async fn apply_and_wait(
    control_plane: &dyn ControlPlane,
    metrics: &Metrics,
    task: &ApplyTask,
) -> Result<AppliedResource, FailureReason> {
    let spec = &task.spec;

    let previous_state = match control_plane.describe(spec.kind, &spec.name).await {
        Ok(Some(observed)) => {
            if observed.status == ResourceStatus::Ready {
                let diffs = compare_values(&observed.config, &spec.config);
                if diffs.is_empty() {
                    log::info!("Resource '{}' is already up to date", spec.name);
                    return Ok(AppliedResource {
                        id: observed.id,
                        action: ApplyAction::Unchanged,
                        previous_state: PreviousState::Existing(ResourceStatus::Ready),
                        status: ResourceStatus::Ready,
                        outputs: observed.outputs,
                        duration: Duration::from_millis(0),
                    });
                }
                log::debug!("Resource '{}' will be updated, found {}", spec.name, diffs);
            }
            PreviousState::Existing(observed.status)
        }
        Ok(None) => PreviousState::Absent,
        Err(err) => {
            log::warn!(
                "Failed to describe resource '{}', will ensure it anyway: {:#}",
                spec.name,
                err
            );
            PreviousState::Unknown
        }
    };

    log::debug!("Ensuring resource '{}' of kind: {}", spec.name, spec.kind);
    let state = control_plane
        .ensure(spec)
        .await
        .map_err(|err| FailureReason::remote(format!("{:#}", err)))?;
    log::debug!(
        "Ensure of '{}' returned action: {}, status: {}",
        spec.name,
        state.action,
        state.status
    );

    let outputs = match state.status {
        ResourceStatus::Ready => state.outputs,
        ResourceStatus::Failed => {
            let message = state
                .message
                .unwrap_or_else(|| format!("resource '{}' failed", spec.name));
            return Err(FailureReason::remote(message));
        }
        ResourceStatus::Pending => {
            let reported = wait_until_ready(control_plane, metrics, &spec.name, &state.id, &task.poll_backoff).await?;
            if reported.is_null() {
                state.outputs
            } else {
                reported
            }
        }
    };

    Ok(AppliedResource {
        id: state.id,
        action: state.action,
        previous_state,
        status: ResourceStatus::Ready,
        outputs,
        duration: Duration::from_millis(0),
    })
}

/// Polls the status with backoff until the resource is either ready or failed, and returns the
/// outputs from the final status report. An error from the control plane is treated as pending,
/// since the status may be temporarily unavailable. The caller is responsible for bounding the
/// total time spent waiting.
pub(crate) async fn wait_until_ready(
    control_plane: &dyn ControlPlane,
    metrics: &Metrics,
    name: &str,
    id: &RemoteId,
    poll_backoff: &BackoffConfig,
) -> Result<Value, FailureReason> {
    let mut backoff = poll_backoff.new_backoff();
    let mut polls: u32 = 0;
    loop {
        let delay = backoff.next_backoff().unwrap_or(poll_backoff.max_interval);
        tokio::time::sleep(delay).await;
        polls += 1;
        metrics.status_polled();

        match control_plane.get_status(id).await {
            Ok(report) => match report.status {
                ResourceStatus::Ready => {
                    log::debug!("Resource '{}' is ready after {} status polls", name, polls);
                    return Ok(report.outputs);
                }
                ResourceStatus::Failed => {
                    let message = report
                        .message
                        .unwrap_or_else(|| format!("resource '{}' failed", name));
                    return Err(FailureReason::remote(message));
                }
                ResourceStatus::Pending => {
                    log::trace!("Resource '{}' is still pending after {} polls", name, polls);
                }
            },
            Err(err) => {
                metrics.status_unavailable();
                log::warn!(
                    "Status of resource '{}' is unavailable, treating it as pending: {:#}",
                    name,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::ResourceKind;
    use crate::runner::testkit::InMemoryControlPlane;
    use serde_json::json;

    fn task(name: &str, timeout: Duration) -> ApplyTask {
        ApplyTask {
            index: 0,
            spec: ResourceSpec {
                kind: ResourceKind::CacheSubnetGroup,
                name: name.to_owned(),
                config: json!({ "groupName": "nn-kube-cache-subnets" }),
                manifest: None,
            },
            timeout,
            poll_backoff: BackoffConfig::fixed_interval(Duration::from_millis(2)),
        }
    }

    async fn apply(control_plane: &InMemoryControlPlane, task: ApplyTask) -> Result<AppliedResource, FailureReason> {
        apply_resource(Arc::new(control_plane.clone()), Arc::new(Metrics::new()), task).await
    }

    #[tokio::test]
    async fn waits_for_the_resource_to_become_ready() {
        let control_plane = InMemoryControlPlane::new().ready_after("subnets", 3);
        let applied = apply(&control_plane, task("subnets", Duration::from_secs(5)))
            .await
            .expect("apply failed");
        assert_eq!(ApplyAction::Created, applied.action);
        assert_eq!(PreviousState::Absent, applied.previous_state);
        assert_eq!(ResourceStatus::Ready, applied.status);
        assert_eq!(json!(applied.id.as_str()), applied.outputs["id"]);
    }

    #[tokio::test]
    async fn unavailable_status_is_treated_as_pending() {
        let control_plane = InMemoryControlPlane::new()
            .ready_after("subnets", 1)
            .status_unavailable("subnets", 3);
        let metrics = Arc::new(Metrics::new());
        let result = apply_resource(
            Arc::new(control_plane.clone()),
            metrics.clone(),
            task("subnets", Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_ok(), "expected success, got: {:?}", result);
        assert_eq!(Some(ResourceStatus::Ready), control_plane.status_of("subnets"));
    }

    #[tokio::test]
    async fn resource_that_never_becomes_ready_times_out() {
        let control_plane = InMemoryControlPlane::new().never_ready("subnets");
        let result = apply(&control_plane, task("subnets", Duration::from_millis(50))).await;
        assert_eq!(Err(FailureReason::Timeout { after_ms: 50 }), result);
    }

    #[tokio::test]
    async fn failed_status_is_a_remote_failure() {
        let control_plane = InMemoryControlPlane::new().fail_on_status("subnets", "subnet quota exceeded");
        let result = apply(&control_plane, task("subnets", Duration::from_secs(5))).await;
        assert_eq!(Err(FailureReason::remote("subnet quota exceeded")), result);
    }

    #[tokio::test]
    async fn ready_resource_with_matching_config_is_not_ensured_again() {
        let control_plane = InMemoryControlPlane::new().seed(
            ResourceKind::CacheSubnetGroup,
            "subnets",
            json!({ "groupName": "nn-kube-cache-subnets", "arn": "arn:subnets" }),
            ResourceStatus::Ready,
        );
        let applied = apply(&control_plane, task("subnets", Duration::from_secs(5)))
            .await
            .expect("apply failed");
        assert_eq!(ApplyAction::Unchanged, applied.action);
        assert_eq!(PreviousState::Existing(ResourceStatus::Ready), applied.previous_state);
        assert_eq!(0, control_plane.ensure_calls());
    }

    #[tokio::test]
    async fn changed_config_is_updated_in_place() {
        let control_plane = InMemoryControlPlane::new().seed(
            ResourceKind::CacheSubnetGroup,
            "subnets",
            json!({ "groupName": "old-name" }),
            ResourceStatus::Ready,
        );
        let applied = apply(&control_plane, task("subnets", Duration::from_secs(5)))
            .await
            .expect("apply failed");
        assert_eq!(ApplyAction::Updated, applied.action);
        assert_eq!(0, control_plane.creations());
        assert_eq!(1, control_plane.updates());
        assert_eq!(
            Some(json!({ "groupName": "nn-kube-cache-subnets" })),
            control_plane.config_of("subnets")
        );
    }

    #[tokio::test]
    async fn describe_errors_do_not_prevent_the_apply() {
        let control_plane = InMemoryControlPlane::new().describe_unavailable("subnets");
        let applied = apply(&control_plane, task("subnets", Duration::from_secs(5)))
            .await
            .expect("apply failed");
        assert_eq!(PreviousState::Unknown, applied.previous_state);
    }
}
