//! Prometheus-style metrics for queue monitoring.
//!
//! [`MetricsHook`] turns lifecycle events into `metrics` counters, gauges and
//! histograms; install any `metrics` recorder to export them.
//!
//! In isolated mode the exec hooks fire inside the worker process, which has
//! no recorder of its own. The parent counts each reaped worker process under
//! [`names::WORKER_EXITS_TOTAL`] instead.

use crate::hooks::{ExecEvent, PushEvent, QueueHook};
use crate::launcher::ExecResult;
use crate::store::QueueStats;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names for the queue.
pub mod names {
    /// Total messages pushed.
    pub const JOBS_PUSHED_TOTAL: &str = "arcana_queue_jobs_pushed_total";
    /// Total attempts started.
    pub const JOBS_STARTED_TOTAL: &str = "arcana_queue_jobs_started_total";
    /// Total attempts completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "arcana_queue_jobs_completed_total";
    /// Total messages failed for good.
    pub const JOBS_FAILED_TOTAL: &str = "arcana_queue_jobs_failed_total";
    /// Total attempts that will be retried.
    pub const JOBS_RETRIED_TOTAL: &str = "arcana_queue_jobs_retried_total";

    /// Current waiting messages.
    pub const JOBS_WAITING: &str = "arcana_queue_jobs_waiting";
    /// Current delayed messages.
    pub const JOBS_DELAYED: &str = "arcana_queue_jobs_delayed";
    /// Current reserved messages.
    pub const JOBS_RESERVED: &str = "arcana_queue_jobs_reserved";

    /// Attempt duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "arcana_queue_job_duration_seconds";

    /// Running worker loops.
    pub const WORKERS_ACTIVE: &str = "arcana_queue_workers_active";
    /// Total worker processes reaped, by exit outcome.
    pub const WORKER_EXITS_TOTAL: &str = "arcana_queue_worker_exits_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_PUSHED_TOTAL, "Total number of messages pushed");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of attempts started");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of attempts completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of messages that failed permanently"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retried attempts");

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting messages");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed messages");
    describe_gauge!(names::JOBS_RESERVED, "Current number of reserved messages");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Attempt execution duration in seconds"
    );

    describe_gauge!(names::WORKERS_ACTIVE, "Number of running worker loops");
    describe_counter!(
        names::WORKER_EXITS_TOTAL,
        "Total number of worker processes reaped, by outcome"
    );
}

/// Publishes store counts as gauges.
pub fn record_stats(stats: &QueueStats) {
    gauge!(names::JOBS_WAITING).set(stats.waiting as f64);
    gauge!(names::JOBS_DELAYED).set(stats.delayed as f64);
    gauge!(names::JOBS_RESERVED).set(stats.reserved as f64);
}

fn exit_outcome(result: &ExecResult) -> &'static str {
    match result {
        ExecResult::Done => "done",
        ExecResult::Retry => "retry",
        ExecResult::Crash(_) => "crash",
    }
}

/// Counts one reaped worker process in the parent.
pub fn record_worker_exit(result: &ExecResult) {
    counter!(names::WORKER_EXITS_TOTAL, "outcome" => exit_outcome(result)).increment(1);
}

fn job_label(event: &ExecEvent) -> String {
    event
        .job_name
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Records lifecycle events as metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsHook;

impl QueueHook for MetricsHook {
    fn on_push(&self, event: &PushEvent) {
        counter!(names::JOBS_PUSHED_TOTAL, "job_name" => event.job_name.clone()).increment(1);
    }

    fn on_before_exec(&self, event: &ExecEvent) {
        counter!(names::JOBS_STARTED_TOTAL, "job_name" => job_label(event)).increment(1);
    }

    fn on_after_exec(&self, event: &ExecEvent) {
        let job_name = job_label(event);
        counter!(names::JOBS_COMPLETED_TOTAL, "job_name" => job_name.clone()).increment(1);
        if let Some(elapsed) = event.elapsed {
            histogram!(
                names::JOB_DURATION_SECONDS,
                "job_name" => job_name,
                "status" => "completed"
            )
            .record(elapsed.as_secs_f64());
        }
    }

    fn on_error(&self, event: &ExecEvent) {
        let job_name = job_label(event);
        if event.retry {
            counter!(
                names::JOBS_RETRIED_TOTAL,
                "job_name" => job_name.clone(),
                "attempt" => event.attempt.to_string()
            )
            .increment(1);
        } else {
            counter!(names::JOBS_FAILED_TOTAL, "job_name" => job_name.clone()).increment(1);
        }

        if let Some(elapsed) = event.elapsed {
            histogram!(
                names::JOB_DURATION_SECONDS,
                "job_name" => job_name,
                "status" => "failed"
            )
            .record(elapsed.as_secs_f64());
        }
    }

    fn on_worker_start(&self, _pid: u32) {
        gauge!(names::WORKERS_ACTIVE).increment(1.0);
    }

    fn on_worker_stop(&self, _pid: u32) {
        gauge!(names::WORKERS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::message::MessageId;
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct Tally {
        key: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl CounterFn for Tally {
        fn increment(&self, value: u64) {
            for _ in 0..value {
                self.log.lock().push(self.key.clone());
            }
        }

        fn absolute(&self, _value: u64) {}
    }

    /// Logs counter increments as `name:outcome`.
    #[derive(Default)]
    struct CountingRecorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let outcome = key
                .labels()
                .find(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .unwrap_or_default();
            Counter::from_arc(Arc::new(Tally {
                key: format!("{}:{}", key.name(), outcome),
                log: self.log.clone(),
            }))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_register_metrics() {
        // Just verify registration doesn't panic
        register_metrics();
    }

    #[test]
    fn test_hook_records_without_recorder() {
        let hook = MetricsHook;
        let mut event = ExecEvent::new(Some(MessageId::new(1)), None, 30, 1, None);
        event.elapsed = Some(Duration::from_millis(5));
        hook.on_before_exec(&event);
        hook.on_after_exec(&event);

        event.error = Some(JobError::Retry("again".into()));
        event.retry = true;
        hook.on_error(&event);
        hook.on_worker_start(1);
        hook.on_worker_stop(1);

        record_stats(&QueueStats::default());
        assert_eq!(job_label(&event), "unknown");
    }

    #[test]
    fn test_worker_exits_are_counted_by_outcome() {
        let recorder = CountingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            record_worker_exit(&ExecResult::Done);
            record_worker_exit(&ExecResult::Retry);
            record_worker_exit(&ExecResult::Crash(JobError::Process("code 9".into())));
        });

        assert_eq!(
            *recorder.log.lock(),
            vec![
                "arcana_queue_worker_exits_total:done",
                "arcana_queue_worker_exits_total:retry",
                "arcana_queue_worker_exits_total:crash",
            ]
        );
    }

    #[tokio::test]
    async fn test_pool_counts_exits_in_parent() {
        use crate::launcher::{LaunchRequest, Launcher, ProcessOutput, WorkerProcess};
        use crate::lifecycle::Lifecycle;
        use crate::pool::{FinishCallback, WorkerPool};
        use crate::queue::Queue;
        use crate::JobResult;
        use async_trait::async_trait;

        struct Exited(i32);

        #[async_trait]
        impl WorkerProcess for Exited {
            fn pid(&self) -> Option<u32> {
                None
            }

            fn try_exit(&mut self) -> JobResult<bool> {
                Ok(true)
            }

            async fn finish(&mut self) -> JobResult<ProcessOutput> {
                Ok(ProcessOutput {
                    code: Some(self.0),
                    ..ProcessOutput::default()
                })
            }
        }

        struct ExitWith(i32);

        impl Launcher for ExitWith {
            fn launch(&self, _request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
                Ok(Box::new(Exited(self.0)))
            }
        }

        let recorder = CountingRecorder::default();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let queue = Queue::builder().build();
        queue.store().push("{}".into(), queue.defaults()).await.unwrap();
        let message = queue.store().reserve(None).await.unwrap().unwrap();

        let mut pool = WorkerPool::new(
            Arc::new(ExitWith(7)),
            Lifecycle::new(queue.clone()),
            1,
            Duration::from_millis(1),
        );
        let on_finish: FinishCallback = Box::new(|_| Box::pin(async { Ok(()) }));
        pool.submit(message, on_finish).await.unwrap();
        pool.drain().await.unwrap();

        assert_eq!(
            *recorder.log.lock(),
            vec!["arcana_queue_worker_exits_total:crash"]
        );
    }
}
