//! End-to-end runs of the video pipeline against the in-memory provider.

mod common;

use duraflow::pipeline::{
    self, CleanupInput, PipelineConfig, PipelineError, ProcessVideoInput, ProcessVideoOutput,
    RetryOptions,
};
use duraflow::runtime::OrchestrationStatus;
use duraflow::{codec, Event};

fn process_input(video: &str, approval_timeout_ms: u64) -> ProcessVideoInput {
    ProcessVideoInput {
        video: video.into(),
        config: PipelineConfig {
            bitrates: vec![320, 240],
            approval_timeout_ms,
            retry: RetryOptions {
                max_attempts: 3,
                base_delay_ms: 10,
            },
            notify_address: "reviewer@example.com".into(),
            intro_location: "intro.mp4".into(),
        },
    }
}

async fn pipeline_host() -> common::TestHost {
    let (store, correlations) = common::stores();
    common::start_host(
        store,
        correlations.clone(),
        pipeline::orchestrations(),
        pipeline::activities(correlations),
    )
    .await
}

#[tokio::test]
async fn approved_video_is_published() {
    let host = pipeline_host().await;
    host.client
        .start_orchestration_typed("vid-approve", pipeline::PROCESS_VIDEO, &process_input("clip.mp4", 10_000))
        .await
        .unwrap();

    let token = common::approval_token(&host.store, "vid-approve", 10_000).await;
    host.client.submit_approval(&token, "Approved").await.unwrap();

    let status = host.client.wait_for_orchestration("vid-approve", 10_000).await.unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    let out: ProcessVideoOutput = codec::decode(&output).unwrap();
    assert_eq!(out.transcoded, "clip-320kps.mp4", "highest bitrate wins");
    assert_eq!(out.thumbnail, "clip-thumbnail.png");
    assert_eq!(out.with_introduction, "clip-320kps-withintro.mp4");
    assert_eq!(out.approval_result, "Approved");
    assert!(out.published);

    // The token is single-use: a second submission must fail at the client.
    let err = host.client.submit_approval(&token, "Approved").await.unwrap_err();
    assert!(err.contains("unknown or already used"), "got: {err}");

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn rejected_video_is_not_published() {
    let host = pipeline_host().await;
    host.client
        .start_orchestration_typed("vid-reject", pipeline::PROCESS_VIDEO, &process_input("clip.mp4", 10_000))
        .await
        .unwrap();

    let token = common::approval_token(&host.store, "vid-reject", 10_000).await;
    host.client.submit_approval(&token, "Rejected").await.unwrap();

    let status = host.client.wait_for_orchestration("vid-reject", 10_000).await.unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    let out: ProcessVideoOutput = codec::decode(&output).unwrap();
    assert_eq!(out.approval_result, "Rejected");
    assert!(!out.published);

    let history = host.store.read("vid-reject").await;
    let rejected = history
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == pipeline::REJECT_VIDEO));
    assert!(rejected, "RejectVideo should run on rejection");

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn missed_approval_deadline_rejects_the_video() {
    let host = pipeline_host().await;
    host.client
        .start_orchestration_typed("vid-timeout", pipeline::PROCESS_VIDEO, &process_input("clip.mp4", 100))
        .await
        .unwrap();

    let status = host.client.wait_for_orchestration("vid-timeout", 10_000).await.unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    let out: ProcessVideoOutput = codec::decode(&output).unwrap();
    assert_eq!(out.approval_result, "Timed Out");
    assert!(!out.published);

    // A straggler approval after the deadline changes nothing.
    let token = common::approval_token(&host.store, "vid-timeout", 1_000).await;
    let _ = host.client.submit_approval(&token, "Approved").await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let status = host.client.get_status("vid-timeout").await;
    let OrchestrationStatus::Completed { output } = status else {
        panic!("late approval must not reopen the instance, got {status:?}");
    };
    let out: ProcessVideoOutput = codec::decode(&output).unwrap();
    assert!(!out.published);

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn thumbnail_failure_cleans_up_intermediates() {
    let host = pipeline_host().await;
    host.client
        .start_orchestration_typed(
            "vid-broken",
            pipeline::PROCESS_VIDEO,
            &process_input("clip-error.mp4", 10_000),
        )
        .await
        .unwrap();

    let status = host.client.wait_for_orchestration("vid-broken", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    let pipeline_error: PipelineError = codec::decode(&error).unwrap();
    assert_eq!(pipeline_error.kind, "thumbnail");
    assert!(pipeline_error.message.contains("thumbnail extraction failed"));

    let history = host.store.read("vid-broken").await;

    let scheduled = history
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == pipeline::EXTRACT_THUMBNAIL))
        .count();
    assert_eq!(scheduled, 1);
    // The error is permanent, so the policy's remaining attempts are skipped.
    let failed_attempt = history.iter().find_map(|e| match e {
        Event::ActivityFailed { attempt, .. } => Some(*attempt),
        _ => None,
    });
    assert_eq!(failed_attempt, Some(1), "no retry of a permanent error");

    // Cleanup ran over the one intermediate that existed.
    let cleanup_input = history
        .iter()
        .find_map(|e| match e {
            Event::ActivityScheduled { name, input, .. } if name == pipeline::CLEANUP => Some(input.clone()),
            _ => None,
        })
        .expect("cleanup scheduled");
    let cleanup: CleanupInput = codec::decode(&cleanup_input).unwrap();
    assert_eq!(
        cleanup.files,
        vec![Some("clip-error-320kps.mp4".to_string()), None, None]
    );

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn transcode_fans_out_per_bitrate() {
    let host = pipeline_host().await;
    host.client
        .start_orchestration_typed("vid-fan", pipeline::PROCESS_VIDEO, &process_input("clip.mp4", 100))
        .await
        .unwrap();
    host.client.wait_for_orchestration("vid-fan", 10_000).await.unwrap();

    let history = host.store.read("vid-fan").await;
    let child = history
        .iter()
        .find_map(|e| match e {
            Event::SubOrchestrationScheduled { instance, .. } => Some(instance.clone()),
            _ => None,
        })
        .expect("transcode child scheduled");
    assert!(child.starts_with("vid-fan::sub-"), "got child instance {child}");
    let status = host.client.get_status(&child).await;
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected transcode child completion, got {status:?}");
    };
    let files: Vec<pipeline::VideoFile> = codec::decode(&output).unwrap();
    assert_eq!(files.len(), 2, "one variant per configured bitrate");
    assert!(files.iter().any(|f| f.location == "clip-320kps.mp4" && f.bitrate == 320));
    assert!(files.iter().any(|f| f.location == "clip-240kps.mp4" && f.bitrate == 240));

    host.runtime.shutdown().await;
}
