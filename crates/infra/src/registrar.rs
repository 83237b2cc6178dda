//! Candidate arrival → durable job identity.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use im2_core::{ErrorKind, Job, JobId, JobState};
use im2_events::{PipelineEvent, PipelineEventKind};

use crate::detector::CandidateArrival;
use crate::publish::EventSink;
use crate::store::{InsertOutcome, JobStore, StoreError};

/// How a registration request was resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A new job was created.
    Registered,
    /// The source artifact already has a job; its id is returned.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub job_id: JobId,
    pub state: JobState,
    pub outcome: RegistrationOutcome,
}

impl Registration {
    /// `DuplicateJob` for a collision, nothing otherwise.
    pub fn condition(&self) -> Option<ErrorKind> {
        match self.outcome {
            RegistrationOutcome::Registered => None,
            RegistrationOutcome::Duplicate => Some(ErrorKind::DuplicateJob),
        }
    }
}

/// Creates job records exactly once per source artifact.
pub struct JobRegistrar {
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventSink>,
}

impl JobRegistrar {
    pub fn new(store: Arc<dyn JobStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub fn register(&self, arrival: &CandidateArrival) -> Result<Registration, StoreError> {
        if let Some(existing) = self.store.find_by_source(&arrival.source_path)? {
            return Ok(duplicate(&existing));
        }

        let job = Job::register(
            arrival.owner_id.clone(),
            arrival.source_path.clone(),
            arrival.batch_marker.clone(),
            arrival.detection_seq,
            arrival.detected_at.max(Utc::now()),
        );

        match self.store.insert_if_absent(job)? {
            InsertOutcome::Inserted(job) => {
                info!(
                    job_id = %job.job_id(),
                    trace_id = %job.trace_id(),
                    owner = %job.owner_id(),
                    batch = %job.batch_marker(),
                    source = %job.source_reference().display(),
                    "job registered"
                );
                self.events
                    .emit(PipelineEvent::for_job(&job, PipelineEventKind::JobRegistered));
                Ok(Registration {
                    job_id: job.job_id(),
                    state: job.state(),
                    outcome: RegistrationOutcome::Registered,
                })
            }
            // Lost the race to a concurrent registrar.
            InsertOutcome::Existing(job) => Ok(duplicate(&job)),
        }
    }

    /// Whether any job already owns `source`. Errors count as "yes" so a
    /// store outage never leads to a second registration.
    pub fn knows(&self, source: &Path) -> bool {
        match self.store.find_by_source(source) {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(source = %source.display(), error = %err, "registry lookup failed");
                true
            }
        }
    }
}

fn duplicate(job: &Job) -> Registration {
    info!(
        job_id = %job.job_id(),
        trace_id = %job.trace_id(),
        source = %job.source_reference().display(),
        "duplicate arrival resolved to existing job"
    );
    Registration {
        job_id: job.job_id(),
        state: job.state(),
        outcome: RegistrationOutcome::Duplicate,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use im2_core::OwnerId;
    use im2_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::store::InMemoryJobStore;

    fn arrival(path: &str, seq: u64) -> CandidateArrival {
        CandidateArrival {
            owner_id: OwnerId::parse("owner-42").unwrap(),
            batch_marker: "batch-1".into(),
            source_path: PathBuf::from(path),
            detected_at: Utc::now(),
            detection_seq: seq,
        }
    }

    #[test]
    fn duplicate_arrival_returns_existing_job() {
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let sub = bus.subscribe();
        let registrar = JobRegistrar::new(InMemoryJobStore::arc(), bus.clone());

        let first = registrar.register(&arrival("/in/owner-42/batch-1/track.wav", 1)).unwrap();
        let second = registrar.register(&arrival("/in/owner-42/batch-1/track.wav", 2)).unwrap();

        assert_eq!(first.outcome, RegistrationOutcome::Registered);
        assert_eq!(first.state, JobState::Registered);
        assert_eq!(second.outcome, RegistrationOutcome::Duplicate);
        assert_eq!(second.condition(), Some(ErrorKind::DuplicateJob));
        assert_eq!(first.job_id, second.job_id);

        // Only the real registration is announced.
        assert_eq!(sub.drain().len(), 1);
        assert!(registrar.knows(Path::new("/in/owner-42/batch-1/track.wav")));
        assert!(!registrar.knows(Path::new("/in/owner-42/batch-1/other.wav")));
    }
}
