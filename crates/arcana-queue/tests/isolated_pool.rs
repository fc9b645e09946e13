//! Isolated execution through the worker pool, with scripted launchers.

use arcana_queue::{
    CommandLauncher, Dispatcher, ExecEvent, ExecResult, Job, JobContext, JobError, JobResult,
    LaunchRequest, Launcher, Lifecycle, ProcessOutput, Queue, QueueHook, QueuedJob, RetryPolicy,
    Status, Worker, WorkerOptions, WorkerPool, WorkerProcess, CaptureSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Noop;

#[async_trait]
impl Job for Noop {
    const NAME: &'static str = "noop";

    async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        Ok(())
    }
}

/// Asks for another attempt until `until`.
#[derive(Debug, Serialize, Deserialize)]
struct RetryUntil {
    until: u32,
}

#[async_trait]
impl Job for RetryUntil {
    const NAME: &'static str = "retry_until";

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.attempt < self.until {
            return Err(JobError::Retry(format!("attempt {}", ctx.attempt)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    errors: Mutex<Vec<(Option<u64>, String, bool)>>,
    before: Mutex<Vec<u32>>,
}

impl QueueHook for Recorder {
    fn on_before_exec(&self, event: &ExecEvent) {
        self.before.lock().push(event.attempt);
    }

    fn on_error(&self, event: &ExecEvent) {
        let error = event
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        self.errors
            .lock()
            .push((event.id.map(|id| id.get()), error, event.retry));
    }
}

fn queue(recorder: &Arc<Recorder>) -> Queue {
    Queue::builder()
        .register::<Noop>()
        .register::<RetryUntil>()
        .retry_policy(RetryPolicy::fixed(5, 0))
        .hook(recorder.clone())
        .build()
}

fn options(max_processes: usize) -> WorkerOptions {
    WorkerOptions {
        isolate: true,
        max_processes,
        poll_interval: Duration::from_millis(2),
    }
}

/// Exits with a fixed code as soon as it is polled.
struct ExitWith(i32);

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

impl Launcher for ExitWith {
    fn launch(&self, _request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
        Ok(Box::new(Exited(self.0)))
    }
}

/// Runs the attempt in this process through `Worker::exec`, like a re-entered child.
struct InProcess {
    queue: Queue,
}

struct Reentry {
    queue: Queue,
    request: LaunchRequest,
}

#[async_trait]
impl WorkerProcess for Reentry {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> JobResult<bool> {
        Ok(true)
    }

    async fn finish(&mut self) -> JobResult<ProcessOutput> {
        let result = Worker::exec(
            &self.queue,
            self.request.id,
            self.request.ttr,
            self.request.attempt,
            Some(self.request.worker_pid),
            &self.request.payload,
        )
        .await;
        Ok(ProcessOutput {
            code: Some(result.exit_code()),
            ..ProcessOutput::default()
        })
    }
}

impl Launcher for InProcess {
    fn launch(&self, request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
        Ok(Box::new(Reentry {
            queue: self.queue.clone(),
            request: request.clone(),
        }))
    }
}

/// Processes stay alive until the gate opens; tracks concurrency.
#[derive(Default)]
struct Gated {
    open: Arc<AtomicBool>,
    launched: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct GatedProcess {
    open: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    polls: u32,
}

#[async_trait]
impl WorkerProcess for GatedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> JobResult<bool> {
        self.polls += 1;
        Ok(self.open.load(Ordering::SeqCst) && self.polls > 2)
    }

    async fn finish(&mut self) -> JobResult<ProcessOutput> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessOutput {
            code: Some(0),
            ..ProcessOutput::default()
        })
    }
}

impl Launcher for Gated {
    fn launch(&self, _request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(GatedProcess {
            open: self.open.clone(),
            live: self.live.clone(),
            polls: 0,
        }))
    }
}

/// Each launch takes its own gate and exit code, in order.
struct Scripted {
    script: Mutex<VecDeque<(Arc<AtomicBool>, i32)>>,
}

impl Scripted {
    fn new(script: Vec<(Arc<AtomicBool>, i32)>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

struct ScriptedProcess {
    open: Arc<AtomicBool>,
    code: i32,
}

#[async_trait]
impl WorkerProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> JobResult<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }

    async fn finish(&mut self) -> JobResult<ProcessOutput> {
        Ok(ProcessOutput {
            code: Some(self.code),
            ..ProcessOutput::default()
        })
    }
}

impl Launcher for Scripted {
    fn launch(&self, _request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
        let (open, code) = self
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| JobError::Internal("no scripted process left".into()))?;
        Ok(Box::new(ScriptedProcess { open, code }))
    }
}

fn gate() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[tokio::test]
async fn test_pool_of_one_defers_second_spawn() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    queue.push(Noop).await.unwrap();
    queue.push(Noop).await.unwrap();

    let gated = Gated::default();
    let open = gated.open.clone();
    let launched = gated.launched.clone();
    let pool = WorkerPool::new(
        Arc::new(gated),
        Lifecycle::new(queue.clone()),
        1,
        Duration::from_millis(2),
    );
    let mut dispatcher = Dispatcher::isolated(pool);

    let first = queue.store().reserve(None).await.unwrap().unwrap();
    let second = queue.store().reserve(None).await.unwrap().unwrap();
    dispatcher.dispatch(first.clone(), 1).await.unwrap();
    assert_eq!(dispatcher.active(), 1);

    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        dispatcher.dispatch(second.clone(), 1),
    )
    .await;
    assert!(blocked.is_err(), "second spawn must wait for a free slot");
    assert_eq!(launched.load(Ordering::SeqCst), 1);

    open.store(true, Ordering::SeqCst);
    dispatcher.dispatch(second.clone(), 1).await.unwrap();
    assert_eq!(launched.load(Ordering::SeqCst), 2);
    dispatcher.drain().await.unwrap();

    assert_eq!(queue.status(first.id).await.unwrap(), Status::Done);
    assert_eq!(queue.status(second.id).await.unwrap(), Status::Done);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_processes() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(queue.push(Noop).await.unwrap());
    }

    let gated = Gated::default();
    gated.open.store(true, Ordering::SeqCst);
    let peak = gated.peak.clone();
    let launched = gated.launched.clone();

    let mut worker = Worker::with_launcher(queue.clone(), &options(3), Arc::new(gated));
    assert_eq!(worker.run().await.unwrap(), 12);

    assert_eq!(launched.load(Ordering::SeqCst), 12);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(worker.dispatcher().active(), 0);
    for id in ids {
        assert_eq!(queue.status(id).await.unwrap(), Status::Done);
    }
}

#[tokio::test]
async fn test_missing_executable_fails_message_through_on_error() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push(Noop).await.unwrap();

    let launcher = CommandLauncher::new("/nonexistent/arcana-queue-worker").arg("exec");
    let mut worker = Worker::with_launcher(queue.clone(), &options(2), Arc::new(launcher));
    worker.run().await.unwrap();

    assert_eq!(worker.dispatcher().active(), 0);
    assert_eq!(queue.status(id).await.unwrap(), Status::Done);

    let errors = recorder.errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, Some(id.get()));
    assert!(errors[0].1.contains("spawn"), "got {}", errors[0].1);
    assert!(!errors[0].2);
}

#[tokio::test]
async fn test_retry_exit_requeues_instead_of_completing() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push(Noop).await.unwrap();

    let pool = WorkerPool::new(
        Arc::new(ExitWith(3)),
        Lifecycle::new(queue.clone()),
        1,
        Duration::from_millis(2),
    );
    let mut dispatcher = Dispatcher::isolated(pool);

    let message = queue.store().reserve(None).await.unwrap().unwrap();
    dispatcher.dispatch(message, 1).await.unwrap();
    dispatcher.drain().await.unwrap();

    assert_eq!(queue.status(id).await.unwrap(), Status::Waiting);
    let again = queue.store().reserve(None).await.unwrap().unwrap();
    assert_eq!(again.attempt, 2);
    assert!(recorder.errors.lock().is_empty());
}

#[tokio::test]
async fn test_crash_exit_reports_error_and_fails_message() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push(Noop).await.unwrap();

    let mut worker = Worker::with_launcher(queue.clone(), &options(1), Arc::new(ExitWith(9)));
    assert_eq!(worker.run().await.unwrap(), 1);

    assert_eq!(queue.status(id).await.unwrap(), Status::Done);
    let errors = recorder.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].1.is_empty());
    assert!(errors[0].1.contains('9'));
}

#[tokio::test]
async fn test_attempt_chain_runs_until_success() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push(RetryUntil { until: 3 }).await.unwrap();

    let launcher = InProcess {
        queue: queue.clone(),
    };
    let mut worker = Worker::with_launcher(queue.clone(), &options(1), Arc::new(launcher));
    assert_eq!(worker.run().await.unwrap(), 3);

    assert_eq!(*recorder.before.lock(), vec![1, 2, 3]);
    assert_eq!(queue.status(id).await.unwrap(), Status::Done);

    let errors = recorder.errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|(_, _, retry)| *retry));
}

#[tokio::test]
async fn test_attempts_stop_at_policy_limit() {
    let recorder = Arc::new(Recorder::default());
    let queue = Queue::builder()
        .register::<RetryUntil>()
        .retry_policy(RetryPolicy::fixed(2, 0))
        .hook(recorder.clone())
        .build();
    let id = queue.push(RetryUntil { until: 10 }).await.unwrap();

    let launcher = InProcess {
        queue: queue.clone(),
    };
    let mut worker = Worker::with_launcher(queue.clone(), &options(1), Arc::new(launcher));
    worker.run().await.unwrap();

    assert_eq!(*recorder.before.lock(), vec![1, 2]);
    assert_eq!(queue.status(id).await.unwrap(), Status::Done);
    let retries: Vec<bool> = recorder.errors.lock().iter().map(|e| e.2).collect();
    assert_eq!(retries, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_late_exit_of_expired_attempt_leaves_new_holder_alone() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push_with(QueuedJob::new(Noop).ttr(1)).await.unwrap();

    let (stale_gate, live_gate) = (gate(), gate());
    let launcher = Scripted::new(vec![(stale_gate.clone(), 3), (live_gate.clone(), 0)]);
    let pool = WorkerPool::new(
        Arc::new(launcher),
        Lifecycle::new(queue.clone()),
        2,
        Duration::from_millis(2),
    );
    let mut dispatcher = Dispatcher::isolated(pool);

    let stale = queue.store().reserve(None).await.unwrap().unwrap();
    dispatcher.dispatch(stale, 1).await.unwrap();

    // The first child outlives its ttr and the message is handed out again.
    tokio::time::advance(Duration::from_secs(2)).await;
    let live = queue.store().reserve(None).await.unwrap().unwrap();
    assert_eq!(live.attempt, 2);
    dispatcher.dispatch(live, 1).await.unwrap();
    assert_eq!(dispatcher.active(), 2);

    stale_gate.store(true, Ordering::SeqCst);
    while dispatcher.active() > 1 {
        dispatcher.poll().await.unwrap();
    }
    assert_eq!(queue.status(id).await.unwrap(), Status::Reserved);
    assert!(queue.store().reserve(None).await.unwrap().is_none());

    live_gate.store(true, Ordering::SeqCst);
    dispatcher.drain().await.unwrap();
    assert_eq!(queue.status(id).await.unwrap(), Status::Done);
    assert!(queue.store().reserve(None).await.unwrap().is_none());
    assert!(recorder.errors.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_attempt_settles_when_not_handed_out_again() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let id = queue.push_with(QueuedJob::new(Noop).ttr(1)).await.unwrap();

    let slow = gate();
    let pool = WorkerPool::new(
        Arc::new(Scripted::new(vec![(slow.clone(), 0)])),
        Lifecycle::new(queue.clone()),
        1,
        Duration::from_millis(2),
    );
    let mut dispatcher = Dispatcher::isolated(pool);

    let message = queue.store().reserve(None).await.unwrap().unwrap();
    dispatcher.dispatch(message, 1).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    slow.store(true, Ordering::SeqCst);
    dispatcher.drain().await.unwrap();
    assert_eq!(queue.status(id).await.unwrap(), Status::Done);
}

#[tokio::test]
async fn test_run_on_empty_queue_returns_immediately() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);
    let mut worker = Worker::with_launcher(queue, &options(2), Arc::new(ExitWith(0)));

    let dispatched = tokio::time::timeout(Duration::from_millis(100), worker.run())
        .await
        .expect("run should not block")
        .unwrap();
    assert_eq!(dispatched, 0);
}

#[tokio::test]
async fn test_exec_rejects_zero_ttr_or_attempt() {
    let recorder = Arc::new(Recorder::default());
    let queue = queue(&recorder);

    let zero_ttr = Worker::exec(&queue, None, 0, 1, None, "{}").await;
    assert!(matches!(zero_ttr, ExecResult::Crash(JobError::InvalidArgument(_))));

    let zero_attempt = Worker::exec(&queue, None, 30, 0, None, "{}").await;
    assert!(matches!(zero_attempt, ExecResult::Crash(JobError::InvalidArgument(_))));
    assert!(recorder.before.lock().is_empty());
}

#[cfg(unix)]
mod shell {
    use super::*;

    fn sh(script: &str) -> CommandLauncher {
        CommandLauncher::new("/bin/sh").arg("-c").arg(script.to_string())
    }

    async fn run_one(script: &str) -> (Queue, Arc<Recorder>, arcana_queue::MessageId, CaptureSink) {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        let id = queue.push(Noop).await.unwrap();

        let sink = CaptureSink::new();
        let pool = WorkerPool::new(
            Arc::new(sh(script)),
            Lifecycle::new(queue.clone()),
            2,
            Duration::from_millis(5),
        )
        .with_sink(Box::new(sink.clone()));
        let mut dispatcher = Dispatcher::isolated(pool);

        let message = queue.store().reserve(None).await.unwrap().unwrap();
        dispatcher.dispatch(message, 1).await.unwrap();
        dispatcher.drain().await.unwrap();
        (queue, recorder, id, sink)
    }

    #[tokio::test]
    async fn test_exit_zero_completes() {
        let (queue, recorder, id, sink) = run_one("cat >/dev/null; echo done; exit 0").await;
        assert_eq!(queue.status(id).await.unwrap(), Status::Done);
        assert!(recorder.errors.lock().is_empty());
        assert_eq!(sink.stdout_string(), "done\n");
    }

    #[tokio::test]
    async fn test_exit_three_retries() {
        let (queue, recorder, id, _) = run_one("cat >/dev/null; exit 3").await;
        assert_eq!(queue.status(id).await.unwrap(), Status::Waiting);
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_other_exit_crashes() {
        let (queue, recorder, id, sink) = run_one("cat >/dev/null; echo oops >&2; exit 7").await;
        assert_eq!(queue.status(id).await.unwrap(), Status::Done);
        assert_eq!(sink.stderr_string(), "oops\n");

        let errors = recorder.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.contains("code 7"));
    }
}
