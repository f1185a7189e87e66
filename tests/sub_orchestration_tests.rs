//! Parent/child orchestration wiring.

mod common;

use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry, OrchestrationStatus};

fn registries() -> (OrchestrationRegistry, ActivityRegistry) {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx, input: String| async move {
            let child = ctx
                .schedule_sub_orchestration("Child", input)
                .into_sub_orchestration()
                .await?;
            Ok(format!("parent saw: {child}"))
        })
        .register("Child", |ctx, input: String| async move {
            if input == "break" {
                return Err("child failed on purpose".to_string());
            }
            ctx.schedule_activity("Echo", input).into_activity().await
        })
        .register("Orphan", |ctx, input: String| async move {
            ctx.schedule_sub_orchestration("NoSuchChild", input)
                .into_sub_orchestration()
                .await
        })
        .build();
    let activities = ActivityRegistry::builder()
        .register("Echo", |_ctx, input: String| async move { Ok(input) })
        .build();
    (orchestrations, activities)
}

#[tokio::test]
async fn child_result_flows_to_parent() {
    let (orchestrations, activities) = registries();
    let host = common::start_in_memory(orchestrations, activities).await;

    host.client.start_orchestration("p1", "Parent", "hello").await.unwrap();
    let status = host.client.wait_for_orchestration("p1", 10_000).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "parent saw: hello".into()
        }
    );

    // The child ran as its own instance under the parent's name.
    let child_status = host.client.get_status("p1::sub-2").await;
    assert_eq!(
        child_status,
        OrchestrationStatus::Completed {
            output: "hello".into()
        }
    );

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn child_failure_fails_the_awaiting_parent() {
    let (orchestrations, activities) = registries();
    let host = common::start_in_memory(orchestrations, activities).await;

    host.client.start_orchestration("p2", "Parent", "break").await.unwrap();
    let status = host.client.wait_for_orchestration("p2", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("child failed on purpose"), "got: {error}");

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn unregistered_child_surfaces_as_parent_failure() {
    let (orchestrations, activities) = registries();
    let host = common::start_in_memory(orchestrations, activities).await;

    host.client.start_orchestration("p3", "Orphan", "x").await.unwrap();
    let status = host.client.wait_for_orchestration("p3", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("unregistered orchestration: NoSuchChild"), "got: {error}");

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn unregistered_root_orchestration_fails() {
    let (orchestrations, activities) = registries();
    let host = common::start_in_memory(orchestrations, activities).await;

    host.client.start_orchestration("p4", "Nothing", "x").await.unwrap();
    let status = host.client.wait_for_orchestration("p4", 10_000).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("unregistered orchestration: Nothing"), "got: {error}");

    host.runtime.shutdown().await;
}
