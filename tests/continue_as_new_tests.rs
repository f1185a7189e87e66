//! Eternal orchestrations: bounded history across restarts, termination.

mod common;

use duraflow::pipeline::{self, PeriodicInput};
use duraflow::runtime::OrchestrationStatus;
use duraflow::Event;

#[tokio::test]
async fn periodic_task_restarts_with_fresh_history() {
    let (store, correlations) = common::stores();
    let host = common::start_host(
        store,
        correlations.clone(),
        pipeline::orchestrations(),
        pipeline::activities(correlations),
    )
    .await;

    host.client
        .start_orchestration_typed(
            "periodic-1",
            pipeline::PERIODIC_TASK,
            &PeriodicInput {
                times_run: 0,
                interval_ms: 10,
            },
        )
        .await
        .unwrap();

    // Let the loop restart a few times.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        if host.store.latest_execution_id("periodic-1").await >= Some(4) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "loop never reached execution 4");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Terminate the loop. The restart gap makes a single request racy, so
    // keep asking until it lands.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        host.client.terminate_instance("periodic-1", "test over").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let OrchestrationStatus::Terminated { reason } = host.client.get_status("periodic-1").await {
            assert_eq!(reason, "test over");
            break;
        }
        assert!(std::time::Instant::now() < deadline, "terminate never landed");
    }

    // Frozen state: every restart replaced history instead of growing it.
    let history = host.store.read("periodic-1").await;
    assert!(
        history.len() < 12,
        "history must stay bounded across restarts, got {} events",
        history.len()
    );
    assert!(
        matches!(history.first(), Some(Event::OrchestrationContinuedAsNew { event_id: 1, .. })),
        "restarted execution is seeded with its restart marker: {:?}",
        history.first()
    );
    // The carried counter matches the execution number.
    let input = history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { input, .. } => Some(input.clone()),
        _ => None,
    });
    let carried: PeriodicInput = duraflow::codec::decode(&input.expect("start record")).unwrap();
    let execution = host.store.latest_execution_id("periodic-1").await.unwrap();
    assert_eq!(carried.times_run, execution - 1);

    host.runtime.shutdown().await;
}

#[tokio::test]
async fn stale_completions_from_prior_execution_are_dropped() {
    // A slow activity completion arriving after continue-as-new must not
    // corrupt the fresh execution.
    let orchestrations = duraflow::runtime::OrchestrationRegistry::builder()
        .register("Roller", |ctx, input: String| async move {
            let round: u32 = input.parse().unwrap_or(0);
            if round >= 1 {
                return Ok("settled".to_string());
            }
            ctx.schedule_activity("Slow", round.to_string()).into_activity().await?;
            ctx.continue_as_new((round + 1).to_string()).await;
            Ok(String::new())
        })
        .build();
    let activities = duraflow::runtime::ActivityRegistry::builder()
        .register("Slow", |_ctx, input: String| async move { Ok(input) })
        .build();

    let host = common::start_in_memory(orchestrations, activities).await;
    host.client.start_orchestration("roller-1", "Roller", "0").await.unwrap();
    let status = host.client.wait_for_orchestration("roller-1", 10_000).await.unwrap();
    assert_eq!(
        status,
        duraflow::runtime::OrchestrationStatus::Completed {
            output: "settled".into()
        }
    );
    assert_eq!(host.store.latest_execution_id("roller-1").await, Some(2));

    host.runtime.shutdown().await;
}
