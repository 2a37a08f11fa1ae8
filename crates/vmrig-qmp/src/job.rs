//! Background job lifecycle tracking.
//!
//! A background job is observable only through `JOB_STATUS_CHANGE`
//! events. The reducer in this module turns one observed event into the
//! follow-up command the lifecycle requires; [`QmpClient::run_job`]
//! loops it until the job is destroyed, parking events meant for other
//! consumers in a deferred buffer that is spliced back afterwards.

use serde_json::Value;
use tracing::debug;

use crate::client::{EventFilter, QmpClient};
use crate::error::QmpError;
use crate::wire::Event;

/// Tracing target for job tracking.
const JOB_TARGET: &str = "vmrig_qmp::job";

/// How a job was configured and how its failure should be treated.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
    /// The job was started with auto-finalize; no explicit
    /// `job-finalize` is needed on `pending`.
    pub auto_finalize: bool,
    /// The job was started with auto-dismiss; no explicit
    /// `job-dismiss` is needed on `concluded`.
    pub auto_dismiss: bool,
    /// Abortion is an expected outcome rather than a fault.
    pub expect_error: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            auto_finalize: true,
            auto_dismiss: false,
            expect_error: false,
        }
    }
}

/// Per-job bookkeeping across reducer steps.
#[derive(Debug, Default)]
pub struct JobState {
    completion_sent: bool,
}

/// Outcome of one reducer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    /// The event is not a status change for this job; re-queue it for
    /// other consumers.
    NotMine,
    /// The job continues to run.
    Running,
    /// The job has been destroyed.
    Destroyed,
}

impl QmpClient {
    /// Feeds one observed event into a job's lifecycle.
    ///
    /// `ready` issues `block-job-complete` exactly once per job;
    /// `pending` issues `job-finalize` unless auto-finalize;
    /// `concluded` issues `job-dismiss` unless auto-dismiss; the
    /// terminal `null` yields [`JobProgress::Destroyed`]. Statuses the
    /// tracker has no work for (`created`, `running`, `standby`, ...)
    /// are [`JobProgress::Running`].
    ///
    /// # Errors
    ///
    /// On `aborting` with `expect_error` unset, the job list is queried
    /// and the recorded failure surfaces as [`QmpError::JobFailed`];
    /// command failures from the issued follow-ups propagate unchanged.
    pub fn process_job_event(
        &mut self,
        id: &str,
        event: &Event,
        state: &mut JobState,
        policy: &JobPolicy,
    ) -> Result<JobProgress, QmpError> {
        if event.name() != Some("JOB_STATUS_CHANGE") {
            return Ok(JobProgress::NotMine);
        }
        let data = event.data();
        if data.get("id").and_then(Value::as_str) != Some(id) {
            return Ok(JobProgress::NotMine);
        }
        let status = data.get("status").and_then(Value::as_str).unwrap_or("");
        debug!(target: JOB_TARGET, id, status, "job status change");
        match status {
            "ready" => {
                if !state.completion_sent {
                    self.block_job_complete(id)?;
                    state.completion_sent = true;
                }
            }
            "pending" => {
                if !policy.auto_finalize {
                    self.job_finalize(id)?;
                }
            }
            "aborting" => {
                if !policy.expect_error {
                    let reason = self.job_failure_reason(id)?;
                    return Err(QmpError::JobFailed {
                        id: id.to_owned(),
                        reason,
                    });
                }
            }
            "concluded" => {
                if !policy.auto_dismiss {
                    self.job_dismiss(id)?;
                }
            }
            "null" => return Ok(JobProgress::Destroyed),
            _ => {}
        }
        Ok(JobProgress::Running)
    }

    /// Blocks until the job has been destroyed or fails.
    ///
    /// Events that do not belong to this job accumulate in the deferred
    /// buffer and are spliced back onto the main event buffer
    /// (main-buffer-first) before returning, on success and failure
    /// alike, so other consumers still see them.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::process_job_event`]; channel failures from the
    /// blocking event wait propagate as well.
    pub fn run_job(&mut self, id: &str, policy: &JobPolicy) -> Result<(), QmpError> {
        let mut state = JobState::default();
        let outcome = loop {
            let event = match self.event_wait(EventFilter::Any) {
                Ok(event) => event,
                Err(error) => break Err(error),
            };
            match self.process_job_event(id, &event, &mut state, policy) {
                Ok(JobProgress::NotMine) => self.deferred.push(event),
                Ok(JobProgress::Running) => {}
                Ok(JobProgress::Destroyed) => break Ok(()),
                Err(error) => break Err(error),
            }
        };
        let deferred = std::mem::take(&mut self.deferred);
        self.events.extend(deferred);
        outcome
    }

    fn job_failure_reason(&mut self, id: &str) -> Result<String, QmpError> {
        let jobs = self.query_jobs()?;
        jobs.as_array()
            .and_then(|jobs| {
                jobs.iter()
                    .find(|job| job.get("id").and_then(Value::as_str) == Some(id))
            })
            .and_then(|job| job.get("error"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| QmpError::Violation {
                message: format!("aborting job '{id}' has no recorded failure reason"),
            })
    }
}
