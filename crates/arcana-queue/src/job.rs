//! Job trait, execution context and the registry that (de)serializes jobs.

use crate::error::{JobError, JobResult};
use crate::message::MessageId;
use crate::queue::Queue;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Message id, `None` when executed anonymously (e.g. re-entry without an id).
    pub id: Option<MessageId>,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Time to reserve in seconds.
    pub ttr: u32,

    /// PID of the worker loop that reserved the message, if any.
    pub worker_pid: Option<u32>,

    queue: Queue,
}

impl JobContext {
    pub(crate) fn new(
        queue: Queue,
        id: Option<MessageId>,
        ttr: u32,
        attempt: u32,
        worker_pid: Option<u32>,
    ) -> Self {
        Self {
            id,
            attempt,
            ttr,
            worker_pid,
            queue,
        }
    }

    /// Queue handle, for pushing follow-up jobs.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Returns true if this is the first attempt.
    pub fn is_first_attempt(&self) -> bool {
        self.attempt == 1
    }
}

/// Trait for defining jobs.
///
/// Implement this trait to create job types that can be pushed to a queue and
/// executed by a worker, inline or in a child process.
///
/// # Example
///
/// ```rust,ignore
/// use arcana_queue::{Job, JobContext, JobError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct ResizeImage {
///     path: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for ResizeImage {
///     const NAME: &'static str = "resize_image";
///
///     async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
///         if !std::path::Path::new(&self.path).exists() {
///             return Err(JobError::Retry("upload not finished".into()));
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name for this job type, written into the payload.
    const NAME: &'static str;

    /// Time to reserve override, in seconds.
    const TTR_SECS: Option<u32> = None;

    /// Execute the job.
    ///
    /// Returning [`JobError::Retry`] or [`JobError::ExecutionFailed`] asks for
    /// another attempt; any other error fails the message permanently.
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Retry policy for this job type; `None` uses the queue's policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Object-safe view of a decoded job.
#[async_trait]
pub trait DynJob: Send + Sync {
    /// Registered job name.
    fn name(&self) -> &'static str;

    /// Executes the job.
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Per-job retry policy, if any.
    fn policy(&self) -> Option<RetryPolicy>;
}

struct Typed<J>(J);

#[async_trait]
impl<J: Job> DynJob for Typed<J> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.0.execute(ctx).await
    }

    fn policy(&self) -> Option<RetryPolicy> {
        self.0.retry_policy()
    }
}

/// Wire form of a job inside a message payload.
#[derive(Debug, Serialize, Deserialize)]
struct JobEnvelope {
    name: String,
    data: serde_json::Value,
}

type Decoder = Box<dyn Fn(serde_json::Value) -> JobResult<Box<dyn DynJob>> + Send + Sync>;

/// Maps job names to decoders so payloads can be turned back into jobs.
#[derive(Default)]
pub struct JobRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("JobRegistry").field("jobs", &names).finish()
    }
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job type.
    pub fn register<J: Job>(&mut self) -> &mut Self {
        let decoder: Decoder = Box::new(|data| {
            let job: J = serde_json::from_value(data)?;
            Ok(Box::new(Typed(job)) as Box<dyn DynJob>)
        });
        self.decoders.insert(J::NAME, decoder);
        self
    }

    /// Returns true if a job type with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Serializes a job into a message payload.
    pub fn serialize<J: Job>(&self, job: &J) -> JobResult<String> {
        if !self.contains(J::NAME) {
            return Err(JobError::UnknownJob(J::NAME.to_string()));
        }
        let envelope = JobEnvelope {
            name: J::NAME.to_string(),
            data: serde_json::to_value(job)?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Builds a payload from a job name and its JSON data, e.g. from the command line.
    pub fn encode(&self, name: &str, data: serde_json::Value) -> JobResult<String> {
        if !self.contains(name) {
            return Err(JobError::UnknownJob(name.to_string()));
        }
        // Decode once so malformed data is rejected at push time.
        self.decoders[name](data.clone())?;
        let envelope = JobEnvelope {
            name: name.to_string(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decodes a message payload into an executable job.
    pub fn deserialize(&self, payload: &str) -> JobResult<Box<dyn DynJob>> {
        let envelope: JobEnvelope = serde_json::from_str(payload)?;
        let decoder = self
            .decoders
            .get(envelope.name.as_str())
            .ok_or_else(|| JobError::UnknownJob(envelope.name.clone()))?;
        decoder(envelope.data)
    }

    /// Reads the job name of a payload without decoding the job itself.
    pub fn job_name(payload: &str) -> Option<String> {
        serde_json::from_str::<JobEnvelope>(payload)
            .ok()
            .map(|envelope| envelope.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestJob {
        message: String,
    }

    #[async_trait]
    impl Job for TestJob {
        const NAME: &'static str = "test_job";

        async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_round_trip_preserves_name() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob>();

        let payload = registry
            .serialize(&TestJob {
                message: "hello".to_string(),
            })
            .unwrap();

        assert_eq!(JobRegistry::job_name(&payload).as_deref(), Some("test_job"));
        let job = registry.deserialize(&payload).unwrap();
        assert_eq!(job.name(), "test_job");
        assert!(job.policy().is_none());
    }

    #[test]
    fn test_serialize_unregistered_job_fails() {
        let registry = JobRegistry::new();
        let err = registry
            .serialize(&TestJob {
                message: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownJob(name) if name == "test_job"));
    }

    #[test]
    fn test_deserialize_unknown_name() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob>();

        let err = registry
            .deserialize(r#"{"name":"other","data":{}}"#)
            .err()
            .unwrap();
        assert!(matches!(err, JobError::UnknownJob(name) if name == "other"));
    }

    #[test]
    fn test_deserialize_garbage() {
        let registry = JobRegistry::new();
        let err = registry.deserialize("not json").err().unwrap();
        assert!(matches!(err, JobError::Serialization(_)));
        assert!(JobRegistry::job_name("not json").is_none());
    }

    #[test]
    fn test_encode_validates_data() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob>();

        let payload = registry
            .encode("test_job", serde_json::json!({"message": "hi"}))
            .unwrap();
        assert_eq!(registry.deserialize(&payload).unwrap().name(), "test_job");

        assert!(matches!(
            registry.encode("test_job", serde_json::json!({"wrong": 1})),
            Err(JobError::Serialization(_))
        ));
        assert!(matches!(
            registry.encode("nope", serde_json::json!({})),
            Err(JobError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_debug_lists_registered_jobs() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob>();
        assert!(format!("{:?}", registry).contains("test_job"));
    }
}
