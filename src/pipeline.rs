//! Video processing workload: a multi-stage pipeline orchestration, a
//! fan-out transcode sub-orchestration, and an eternal periodic task.
//!
//! The pipeline transcodes an upload to every configured bitrate, extracts
//! a thumbnail under a retry policy, prepends an intro clip, then parks on a
//! human approval gated by a single-use token. Any stage failure runs a
//! cleanup activity over whatever intermediate files exist before the
//! instance fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::providers::CorrelationStore;
use crate::runtime::{ActivityRegistry, OrchestrationRegistry};
use crate::{codec, durable_info, durable_warn, DurableOutput, OrchestrationContext, RetryPolicy, WaitResult};

pub const PROCESS_VIDEO: &str = "ProcessVideo";
pub const TRANSCODE_VIDEO: &str = "TranscodeVideo";
pub const PERIODIC_TASK: &str = "PeriodicTask";

/// External event name approvals arrive under.
pub const APPROVAL_EVENT: &str = "ApprovalResult";

pub const TRANSCODE_ACTIVITY: &str = "Transcode";
pub const EXTRACT_THUMBNAIL: &str = "ExtractThumbnail";
pub const PREPEND_INTRO: &str = "PrependIntro";
pub const SEND_APPROVAL_REQUEST: &str = "SendApprovalRequestEmail";
pub const PUBLISH_VIDEO: &str = "PublishVideo";
pub const REJECT_VIDEO: &str = "RejectVideo";
pub const CLEANUP: &str = "Cleanup";
pub const PERIODIC_ACTIVITY: &str = "PeriodicActivity";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub bitrates: Vec<u32>,
    pub approval_timeout_ms: u64,
    pub retry: RetryOptions,
    pub notify_address: String,
    pub intro_location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessVideoInput {
    pub video: String,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFile {
    pub location: String,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeInput {
    pub video: String,
    pub bitrates: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub video: String,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrependInput {
    pub video: String,
    pub intro_location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub token: String,
    pub video: String,
    pub notify_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupInput {
    pub files: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessVideoOutput {
    pub transcoded: String,
    pub thumbnail: String,
    pub with_introduction: String,
    pub approval_result: String,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicInput {
    pub times_run: u64,
    pub interval_ms: u64,
}

/// Registry with the three pipeline orchestrations.
pub fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_typed(PROCESS_VIDEO, process_video)
        .register_typed(TRANSCODE_VIDEO, transcode_video)
        .register_typed(PERIODIC_TASK, periodic_task)
        .build()
}

/// Registry with all pipeline activities. The correlation store backs
/// approval token registration in SendApprovalRequestEmail.
pub fn activities(correlations: Arc<dyn CorrelationStore>) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register_typed(TRANSCODE_ACTIVITY, |_ctx, req: TranscodeRequest| async move {
            Ok(VideoFile {
                location: format!("{}-{}kps.mp4", file_stem(&req.video), req.bitrate),
                bitrate: req.bitrate,
            })
        })
        .register(EXTRACT_THUMBNAIL, |_ctx, video: String| async move {
            if video.contains("error") {
                // Unreadable source data; retrying cannot fix it.
                return Err(format!(
                    "{}thumbnail extraction failed for {video}",
                    crate::retry::FATAL_ERROR_PREFIX
                ));
            }
            Ok(format!("{}-thumbnail.png", file_stem(&video)))
        })
        .register_typed(PREPEND_INTRO, |_ctx, req: PrependInput| async move {
            tracing::info!(
                target: "duraflow::pipeline",
                video = %req.video,
                intro = %req.intro_location,
                "prepending introduction"
            );
            Ok(format!("{}-withintro.mp4", file_stem(&req.video)))
        })
        .register_typed(SEND_APPROVAL_REQUEST, {
            move |ctx, req: ApprovalRequest| {
                let correlations = correlations.clone();
                async move {
                    correlations.register(&req.token, &ctx.instance).await?;
                    tracing::info!(
                        target: "duraflow::pipeline",
                        video = %req.video,
                        to = %req.notify_address,
                        "approval request sent"
                    );
                    Ok(format!("approval requested from {}", req.notify_address))
                }
            }
        })
        .register(PUBLISH_VIDEO, |_ctx, video: String| async move {
            tracing::info!(target: "duraflow::pipeline", video = %video, "publishing video");
            Ok(format!("published:{video}"))
        })
        .register(REJECT_VIDEO, |_ctx, video: String| async move {
            tracing::info!(target: "duraflow::pipeline", video = %video, "rejecting video");
            Ok(format!("rejected:{video}"))
        })
        .register_typed(CLEANUP, |_ctx, input: CleanupInput| async move {
            let mut removed = 0usize;
            for file in input.files.into_iter().flatten() {
                tracing::info!(target: "duraflow::pipeline", file = %file, "removing intermediate file");
                removed += 1;
            }
            Ok(format!("cleaned:{removed}"))
        })
        .register(PERIODIC_ACTIVITY, |_ctx, run: String| async move {
            tracing::info!(target: "duraflow::pipeline", run = %run, "periodic work");
            Ok(run)
        })
        .build()
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

async fn process_video(
    ctx: OrchestrationContext,
    input: ProcessVideoInput,
) -> Result<ProcessVideoOutput, String> {
    let cfg = input.config;
    let retry = RetryPolicy::new(cfg.retry.max_attempts, cfg.retry.base_delay_ms);
    durable_info!(ctx, "processing {}", input.video);

    let transcode_input = codec::encode(&TranscodeInput {
        video: input.video.clone(),
        bitrates: cfg.bitrates.clone(),
    })?;
    let transcoded = match ctx
        .schedule_sub_orchestration(TRANSCODE_VIDEO, transcode_input)
        .into_sub_orchestration()
        .await
    {
        Ok(raw) => {
            let files: Vec<VideoFile> = codec::decode(&raw)?;
            best_quality(&files).ok_or_else(|| "transcode produced no outputs".to_string())?
        }
        Err(e) => return Err(fail_with_cleanup(&ctx, vec![None, None, None], "transcode", e).await),
    };

    let thumbnail = match ctx
        .schedule_activity_with_retry(EXTRACT_THUMBNAIL, input.video.as_str(), retry.clone())
        .into_activity()
        .await
    {
        Ok(t) => t,
        Err(e) => {
            return Err(
                fail_with_cleanup(&ctx, vec![Some(transcoded), None, None], "thumbnail", e).await,
            )
        }
    };

    let prepend_input = codec::encode(&PrependInput {
        video: transcoded.clone(),
        intro_location: cfg.intro_location.clone(),
    })?;
    let with_introduction = match ctx
        .schedule_activity(PREPEND_INTRO, prepend_input)
        .into_activity()
        .await
    {
        Ok(v) => v,
        Err(e) => {
            return Err(fail_with_cleanup(
                &ctx,
                vec![Some(transcoded), Some(thumbnail), None],
                "prepend",
                e,
            )
            .await)
        }
    };

    let token = ctx.new_guid();
    let approval_input = codec::encode(&ApprovalRequest {
        token,
        video: with_introduction.clone(),
        notify_address: cfg.notify_address.clone(),
    })?;
    if let Err(e) = ctx
        .schedule_activity(SEND_APPROVAL_REQUEST, approval_input)
        .into_activity()
        .await
    {
        return Err(fail_with_cleanup(
            &ctx,
            vec![Some(transcoded), Some(thumbnail), Some(with_introduction)],
            "approval_request",
            e,
        )
        .await);
    }

    let (approval_result, approved) =
        match ctx.wait_external_with_timeout(APPROVAL_EVENT, cfg.approval_timeout_ms).await {
            WaitResult::Event(data) => {
                let approved = data == "Approved";
                (data, approved)
            }
            WaitResult::TimedOut => {
                durable_warn!(ctx, "approval timed out for {}", with_introduction);
                ("Timed Out".to_string(), false)
            }
        };

    let published = if approved {
        ctx.schedule_activity(PUBLISH_VIDEO, with_introduction.as_str())
            .into_activity()
            .await?;
        true
    } else {
        ctx.schedule_activity(REJECT_VIDEO, with_introduction.as_str())
            .into_activity()
            .await?;
        false
    };

    durable_info!(ctx, "finished {} (published: {})", input.video, published);
    Ok(ProcessVideoOutput {
        transcoded,
        thumbnail,
        with_introduction,
        approval_result,
        published,
    })
}

fn best_quality(files: &[VideoFile]) -> Option<String> {
    files.iter().max_by_key(|f| f.bitrate).map(|f| f.location.clone())
}

/// Run cleanup over whatever intermediates exist, then produce the encoded
/// pipeline error the instance fails with.
async fn fail_with_cleanup(
    ctx: &OrchestrationContext,
    files: Vec<Option<String>>,
    kind: &str,
    message: String,
) -> String {
    durable_warn!(ctx, "{kind} stage failed: {message}");
    if let Ok(input) = codec::encode(&CleanupInput { files }) {
        // Best effort: a cleanup failure must not mask the stage error.
        let _ = ctx.schedule_activity(CLEANUP, input).into_activity().await;
    }
    codec::encode(&PipelineError {
        kind: kind.to_string(),
        message: message.clone(),
    })
    .unwrap_or(message)
}

/// Fan out one transcode activity per bitrate and collect every variant.
async fn transcode_video(ctx: OrchestrationContext, input: TranscodeInput) -> Result<Vec<VideoFile>, String> {
    let mut futures = Vec::with_capacity(input.bitrates.len());
    for bitrate in &input.bitrates {
        let request = codec::encode(&TranscodeRequest {
            video: input.video.clone(),
            bitrate: *bitrate,
        })?;
        futures.push(ctx.schedule_activity(TRANSCODE_ACTIVITY, request));
    }
    let outputs = ctx.join(futures).await;
    let mut files = Vec::with_capacity(outputs.len());
    for output in outputs {
        match output {
            DurableOutput::Activity(Ok(raw)) => files.push(codec::decode::<VideoFile>(&raw)?),
            DurableOutput::Activity(Err(e)) => return Err(e),
            other => return Err(format!("unexpected output from transcode fan-out: {other:?}")),
        }
    }
    Ok(files)
}

/// Eternal orchestration: one round of work, a pause, then a restart with
/// fresh history carrying the incremented counter.
async fn periodic_task(ctx: OrchestrationContext, input: PeriodicInput) -> Result<u64, String> {
    let times_run = input.times_run + 1;
    durable_info!(ctx, "periodic run {times_run}");
    ctx.schedule_activity(PERIODIC_ACTIVITY, times_run.to_string())
        .into_activity()
        .await?;
    ctx.schedule_timer(input.interval_ms).into_timer().await;
    let next = codec::encode(&PeriodicInput {
        times_run,
        interval_ms: input.interval_ms,
    })?;
    ctx.continue_as_new(next).await;
    Ok(times_run)
}
