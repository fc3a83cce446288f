//! Job management API handlers

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    Json,
};
use docmaker_common::{Pagination, Result, ValidatedJson};
use docmaker_stages::{
    JobRequest, MusicTrack, VideoDuration, VideoSettings, VisualStyle, VoiceProfile,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::api::middleware::JobsState;
use crate::domain::entities::JobSnapshot;
use crate::domain::state::JobStatus;
use crate::manager::{CancelAck, JobManager};

/// Request for submitting a video generation job
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    /// Natural-language description of the video
    #[validate(length(min = 1, max = 4000))]
    pub prompt: String,

    #[serde(default)]
    pub duration: VideoDuration,

    #[serde(default)]
    pub style: VisualStyle,

    #[serde(default)]
    pub music: MusicTrack,

    #[serde(default)]
    pub voice: VoiceProfile,
}

impl CreateJobRequest {
    fn into_job_request(self) -> Result<JobRequest> {
        JobRequest::new(
            self.prompt,
            VideoSettings {
                duration: self.duration,
                style: self.style,
                music: self.music,
                voice: self.voice,
            },
        )
    }
}

/// Response for an accepted submission
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Submit a job; returns as soon as it is queued
pub async fn create_job(
    State(state): State<JobsState>,
    ValidatedJson(req): ValidatedJson<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>)> {
    let request = req.into_job_request()?;
    let job_id = state.manager.submit(request)?;
    let status = accepted_status(&state.manager, job_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse { job_id, status }),
    ))
}

/// Status to report for a job `submit` just accepted.
///
/// A fast job may already be running or finished, and a finished one may
/// already have been evicted; it was still accepted.
fn accepted_status(manager: &JobManager, job_id: Uuid) -> JobStatus {
    manager
        .status(job_id)
        .map(|snapshot| snapshot.status)
        .unwrap_or(JobStatus::Queued)
}

/// List active and retained jobs, newest first
pub async fn list_jobs(
    State(state): State<JobsState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<JobSnapshot>>> {
    let pagination = Pagination {
        offset: params.offset,
        limit: params.limit,
    };
    Ok(Json(state.manager.list(params.status, &pagination)))
}

/// Get a single job by ID
pub async fn get_job(
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobSnapshot>> {
    Ok(Json(state.manager.status(id)?))
}

/// Cancel a job
pub async fn cancel_job(
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelAck>> {
    Ok(Json(state.manager.cancel(id)?))
}

/// Stream job snapshots (SSE) until the job finishes
pub async fn get_job_events(
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<
    Sse<impl futures_core::Stream<Item = std::result::Result<Event, std::convert::Infallible>>>,
> {
    let mut updates = state.manager.subscribe(id)?;

    // Parse Last-Event-ID header to get last seen revision
    let after_revision = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            // Format: {job_id}:{revision}
            v.rsplit(':').next().and_then(|s| s.parse::<u64>().ok())
        });

    let stream = async_stream::stream! {
        let mut last_revision = after_revision;

        loop {
            let snapshot = updates.borrow_and_update().clone();

            if last_revision.is_none_or(|last| snapshot.revision > last) {
                match snapshot_event(&snapshot) {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        tracing::error!(
                            job_id = %snapshot.job_id,
                            revision = snapshot.revision,
                            error = %e,
                            "Failed to serialize job snapshot, closing event stream"
                        );
                        break;
                    }
                }
                last_revision = Some(snapshot.revision);
            }

            // Terminal snapshot is the last one, close the stream
            if snapshot.is_terminal() {
                break;
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    };

    Ok(Sse::new(stream))
}

fn snapshot_event(snapshot: &JobSnapshot) -> serde_json::Result<Event> {
    Ok(Event::default()
        .id(format!("{}:{}", snapshot.job_id, snapshot.revision))
        .event("snapshot")
        .data(serde_json::to_string(snapshot)?))
}
