//! A panicking definition fails its own instance, not the host.

mod common;

use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry, OrchestrationStatus};

#[tokio::test]
async fn panicking_definition_fails_only_its_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Panics", |_ctx, input: String| async move {
            if input != "safe" {
                panic!("nothing works");
            }
            Ok(input)
        })
        .register("Healthy", |_ctx, input: String| async move { Ok(input) })
        .build();
    let host = common::start_in_memory(orchestrations, ActivityRegistry::builder().build()).await;

    host.client.start_orchestration("boom-1", "Panics", "").await.unwrap();
    let status = host.client.wait_for_orchestration("boom-1", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("nothing works"), "got: {error}");

    // The dispatcher survived; other instances still make progress.
    host.client
        .start_orchestration("healthy-1", "Healthy", "still here")
        .await
        .unwrap();
    let status = host.client.wait_for_orchestration("healthy-1", 10_000).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "still here".into()
        }
    );

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn panicking_child_fails_the_awaiting_parent() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx, input: String| async move {
            ctx.schedule_sub_orchestration("Panics", input)
                .into_sub_orchestration()
                .await
        })
        .register("Panics", |_ctx, input: String| async move {
            if input != "safe" {
                panic!("child blew up");
            }
            Ok(input)
        })
        .build();
    let host = common::start_in_memory(orchestrations, ActivityRegistry::builder().build()).await;

    host.client.start_orchestration("boom-parent", "Parent", "").await.unwrap();
    let status = host.client.wait_for_orchestration("boom-parent", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("child blew up"), "got: {error}");

    host.runtime.shutdown().await;
}
