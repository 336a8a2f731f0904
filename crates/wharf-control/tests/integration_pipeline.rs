//! Integration tests for the build/run pipeline driven through the broker.

mod common;

use std::time::Duration;

use common::fixtures::{commit, DeploymentRequest};
use common::TestPlatform;
use wharf_control::{
    ControlError, DeploymentFilter, DeploymentStatus, DeploymentStore, Event, Job, JobKind,
    PipelineOutcome, QueueKind,
};
use wharf_state::Outcome;

#[tokio::test]
async fn node_deployment_is_normalised_built_and_running() {
    let platform = TestPlatform::new();

    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();
    assert_eq!(created.status, DeploymentStatus::Pending);
    assert_eq!(platform.depth(QueueKind::Deployment).await, 1);

    let mut events = platform.notifier.subscribe(&created.id);
    let outcomes = platform.drain(QueueKind::Deployment).await;
    assert_eq!(outcomes, [Outcome::Ack]);

    let details = platform.details(&created.id).await;
    let spec = &details.deployment.build_spec;
    assert_eq!(spec.runtime_image.as_deref(), Some("node:18"));
    assert_eq!(spec.build_command.as_deref(), Some("npm install"));
    assert_eq!(spec.start_command.as_deref(), Some("npm start"));
    assert_eq!(details.deployment.status, DeploymentStatus::Running);
    assert_eq!(details.deployment.commit_sha, commit(1));
    assert_eq!(
        details.deployment.image_tag.as_deref(),
        Some("storefront:0101010")
    );

    let container = details.container.expect("container");
    assert_eq!(container.host_port, 4000);
    assert_eq!(container.container_id, "container-1");

    assert_eq!(
        platform.runtime.calls(),
        ["build storefront:0101010", "run storefront:0101010 4000:3000"]
    );
    assert_eq!(
        platform.runtime.manifests()[0],
        "FROM node:18\nWORKDIR /app\nCOPY . .\nRUN npm install\nEXPOSE 4000\nCMD npm start\n"
    );

    let statuses: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            Event::DeploymentStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        [DeploymentStatus::Building, DeploymentStatus::Running]
    );

    let log = tokio::fs::read_to_string(platform.logs.build_log_path(created.id.as_str()))
        .await
        .unwrap();
    assert!(log.contains("RUN npm install"));
}

#[tokio::test]
async fn build_output_is_streamed_as_build_logs() {
    let platform = TestPlatform::new();
    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();

    let mut events = platform.notifier.subscribe(&created.id);
    platform.drain(QueueKind::Deployment).await;

    let chunks: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            Event::BuildLogs { chunk, .. } => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[1], "#2 [2/4] RUN npm install\n");
}

#[tokio::test]
async fn missing_language_fails_before_enqueue() {
    let platform = TestPlatform::new();

    let err = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).without_language().build())
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Configuration(_)));
    assert_eq!(
        err.to_string(),
        "configuration error: Invalid buildSpec: language or runtimeImage is required"
    );
    assert_eq!(platform.depth(QueueKind::Deployment).await, 0);
    assert!(platform
        .store
        .list(&DeploymentFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missing_port_fails_before_enqueue() {
    let platform = TestPlatform::new();

    let err = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).without_port().build())
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "configuration error: Invalid buildSpec: exposedPort is required"
    );
    assert_eq!(platform.depth(QueueKind::Deployment).await, 0);
}

#[tokio::test]
async fn option_like_branch_is_rejected() {
    let platform = TestPlatform::new();

    let err = platform
        .lifecycle
        .create(
            DeploymentRequest::node(4000)
                .with_branch("--upload-pack=touch /tmp/pwned")
                .build(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Configuration(_)));
    assert_eq!(platform.depth(QueueKind::Deployment).await, 0);
}

#[tokio::test]
async fn failed_build_marks_failed_and_cleans_workspace() {
    let platform = TestPlatform::new();
    platform.runtime.fail_builds(1);

    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();
    let mut events = platform.notifier.subscribe(&created.id);

    let outcome = platform.process(QueueKind::Deployment).await;
    assert_eq!(outcome, Some(Outcome::RetryWithCount(1)));

    let record = platform.record(&created.id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .is_some_and(|e| e.contains("docker exited with code 1")));

    let events = events.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::BuildLogs { chunk, .. } if chunk.contains("Deployment Failed")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::DeploymentStatus { status: DeploymentStatus::Failed, error: Some(_), .. }
    )));

    let workspace = &platform.runtime.contexts()[0];
    assert!(workspace.starts_with(platform.workspace_root()));
    assert!(!workspace.exists());

    let log = tokio::fs::read_to_string(platform.logs.build_log_path(created.id.as_str()))
        .await
        .unwrap();
    assert!(log.contains("npm ERR! missing script: build"));
    assert!(log.contains("Deployment Failed: external command failed"));
}

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let platform = TestPlatform::new();
    platform.runtime.fail_builds(1);

    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();

    let outcomes = platform.drain(QueueKind::Deployment).await;
    assert_eq!(outcomes, [Outcome::RetryWithCount(1), Outcome::Ack]);

    let record = platform.record(&created.id).await;
    assert_eq!(record.status, DeploymentStatus::Running);
    assert_eq!(record.error, None);
    assert_eq!(platform.runtime.calls_starting_with("build").len(), 2);
}

#[tokio::test]
async fn persistent_failure_is_dead_lettered_after_three_retries() {
    let platform = TestPlatform::new();
    platform.runtime.fail_builds(u32::MAX);

    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();

    let outcomes = platform.drain(QueueKind::Deployment).await;
    assert_eq!(
        outcomes,
        [
            Outcome::RetryWithCount(1),
            Outcome::RetryWithCount(2),
            Outcome::RetryWithCount(3),
            Outcome::DeadLetter,
        ]
    );
    assert_eq!(platform.dead_letters(QueueKind::Deployment).await, 1);
    assert_eq!(platform.depth(QueueKind::Deployment).await, 0);
    assert_eq!(platform.status(&created.id).await, DeploymentStatus::Failed);
    assert_eq!(platform.runtime.calls_starting_with("build").len(), 4);
}

#[tokio::test]
async fn unsupported_language_is_dead_lettered_without_retry() {
    let platform = TestPlatform::new();

    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).with_language("cobol").build())
        .await
        .unwrap();

    let outcomes = platform.drain(QueueKind::Deployment).await;
    assert_eq!(outcomes, [Outcome::DeadLetter]);
    assert_eq!(platform.dead_letters(QueueKind::Deployment).await, 1);

    let record = platform.record(&created.id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Unsupported language 'cobol' and no runtime image provided.")));
    assert!(platform.runtime.calls().is_empty());
}

#[tokio::test]
async fn explicit_runtime_image_builds_unknown_language() {
    let platform = TestPlatform::new();

    let record = platform
        .deploy(
            DeploymentRequest::node(4100)
                .with_language("elixir")
                .with_runtime_image("elixir:1.16")
                .with_start_command("mix run --no-halt")
                .build(),
        )
        .await;

    assert_eq!(record.status, DeploymentStatus::Running);
    assert_eq!(
        platform.runtime.manifests()[0],
        "FROM elixir:1.16\nWORKDIR /app\nCOPY . .\nEXPOSE 4100\nCMD mix run --no-halt\n"
    );
}

#[tokio::test]
async fn repository_manifest_is_not_overwritten() {
    let platform = TestPlatform::new();
    platform
        .source
        .add_file("Dockerfile", "FROM custom/base:1\nCMD [\"./serve\"]\n");

    let record = platform.deploy(DeploymentRequest::node(4000).build()).await;

    assert_eq!(record.status, DeploymentStatus::Running);
    assert_eq!(
        platform.runtime.manifests()[0],
        "FROM custom/base:1\nCMD [\"./serve\"]\n"
    );
}

#[tokio::test]
async fn redelivered_job_for_running_deployment_is_harmless() {
    let platform = TestPlatform::new();
    let record = platform.deploy(DeploymentRequest::node(4000).build()).await;

    platform
        .broker
        .publish(
            platform.queues.get(QueueKind::Deployment),
            &Job::new(record.id.clone(), JobKind::DeploymentCreate),
        )
        .await
        .unwrap();

    assert_eq!(
        platform.drain(QueueKind::Deployment).await,
        [Outcome::Ack]
    );
    assert_eq!(platform.runtime.calls_starting_with("run").len(), 1);
    assert_eq!(platform.status(&record.id).await, DeploymentStatus::Running);
}

#[tokio::test]
async fn overlapping_runs_build_a_deployment_once() {
    let platform = TestPlatform::new();
    platform.runtime.set_build_delay(Duration::from_millis(300));
    let created = platform
        .lifecycle
        .create(DeploymentRequest::node(4000).build())
        .await
        .unwrap();
    let mut events = platform.notifier.subscribe(&created.id);

    let (first, second) = tokio::join!(platform.pipeline.run(&created.id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        platform.pipeline.run(&created.id).await
    });

    assert!(matches!(first.unwrap(), PipelineOutcome::Deployed(_)));
    assert!(matches!(second.unwrap(), PipelineOutcome::InProgress));
    assert_eq!(platform.runtime.calls_starting_with("build").len(), 1);
    assert_eq!(platform.runtime.calls_starting_with("run").len(), 1);
    assert_eq!(platform.status(&created.id).await, DeploymentStatus::Running);

    let failed = events.drain().into_iter().any(|e| {
        matches!(
            e,
            Event::DeploymentStatus {
                status: DeploymentStatus::Failed,
                ..
            }
        )
    });
    assert!(!failed);
}

#[tokio::test]
async fn job_on_wrong_queue_is_dead_lettered() {
    let platform = TestPlatform::new();
    let record = platform.deploy(DeploymentRequest::node(4000).build()).await;

    platform
        .broker
        .publish(
            platform.queues.get(QueueKind::Deployment),
            &Job::new(record.id.clone(), JobKind::ContainerStop),
        )
        .await
        .unwrap();

    assert_eq!(
        platform.drain(QueueKind::Deployment).await,
        [Outcome::DeadLetter]
    );
    assert_eq!(platform.status(&record.id).await, DeploymentStatus::Running);
}

#[tokio::test]
async fn second_deployment_on_held_port_conflicts() {
    let platform = TestPlatform::new();
    let first = platform.deploy(DeploymentRequest::node(4000).build()).await;

    let err = platform
        .lifecycle
        .create(
            DeploymentRequest::python(4000)
                .with_repo("git@github.com:acme/billing.git")
                .build(),
        )
        .await
        .unwrap_err();

    match err {
        ControlError::Conflict { port, holder } => {
            assert_eq!(port, 4000);
            assert_eq!(holder, first.id.to_string());
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(platform.depth(QueueKind::Deployment).await, 0);

    let other_port = platform
        .lifecycle
        .create(
            DeploymentRequest::python(4001)
                .with_repo("git@github.com:acme/billing.git")
                .build(),
        )
        .await;
    assert!(other_port.is_ok());
}
