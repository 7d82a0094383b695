//! AutomationEngine: the sample → exchange → act → evaluate task loop.
//!
//! # How a run works (for beginners)
//!
//! A run walks the [`TaskQueue`] `repeat_count` times.  For the task under
//! the cursor the worker:
//!
//! 1. samples the screen and the device metadata,
//! 2. sends them with the task id and its variables to `process_image`,
//! 3. replays the returned touch actions,
//! 4. advances the cursor if the service says the task is complete, or waits
//!    `poll_interval` and tries the same task again.
//!
//! A "session expired" answer triggers exactly one re-authentication, after
//! which the same request is retried with the fresh session (the screen is
//! not re-sampled).  Any other failure ends the run.
//!
//! # Threading
//!
//! Each run is one Tokio task carrying a [`CancellationToken`].  Stop
//! requests are honoured only at loop boundaries (before sampling, before
//! advancing, and during the idle wait between polls), so an in-flight
//! exchange or gesture always finishes.  The worker reports through an
//! [`EngineEvent`] channel and never touches caller-owned state.  A drop
//! guard clears the running flag and emits [`EngineEvent::Stopped`] on every
//! exit path, including panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ark_core::domain::action::parse_actions;
use ark_core::protocol::endpoints;
use ark_core::{
    AuthSession, Device, DeviceState, ErrorKind, Resolution, ServerResponse, TaskInstance,
    TaskQueue, TouchAction,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::application::authenticate::AuthError;

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Resolution and model reported alongside every screen sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub resolution: Resolution,
    pub model: String,
}

impl DeviceMetadata {
    /// Wire form: `{"resolution": [w, h], "model": "..."}`.
    pub fn to_json(&self) -> Value {
        json!({
            "resolution": [self.resolution.width, self.resolution.height],
            "model": self.model,
        })
    }
}

/// Produces encoded screen frames for a device.
#[async_trait]
pub trait ScreenSampler: Send + Sync {
    /// Returns an encoded frame, or `None` if the capture failed.
    async fn sample(&self, device: &Device) -> Option<Vec<u8>>;

    /// Returns the device's resolution and model, or `None` on failure.
    async fn device_info(&self, device: &Device) -> Option<DeviceMetadata>;
}

/// Sends one request to the remote service and returns its decoded answer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestExchanger: Send + Sync {
    /// `None` means no usable response (transport, framing, or crypto failure).
    async fn exchange(&self, endpoint: &str, data: Value) -> Option<Value>;
}

/// Error returned when a touch action could not be performed.
#[derive(Debug, Error)]
pub enum ActuationError {
    /// The action was rejected before anything reached the device.
    #[error("invalid action: {0}")]
    Invalid(String),
    /// The device or its touch daemon failed.
    #[error("device error: {0}")]
    Device(String),
}

/// Performs server-issued touch actions on a device.
#[async_trait]
pub trait TouchActuator: Send + Sync {
    async fn perform(&self, device: &Device, actions: &[TouchAction])
        -> Result<(), ActuationError>;
}

/// Owns the current session and can renew it once it expires.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// The current session, if any.
    fn session(&self) -> Option<AuthSession>;

    /// Logs in again with the cached credential.
    async fn reauthenticate(&self) -> Result<AuthSession, AuthError>;
}

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EnginePorts {
    pub sampler: Arc<dyn ScreenSampler>,
    pub exchanger: Arc<dyn RequestExchanger>,
    pub actuator: Arc<dyn TouchActuator>,
    pub auth: Arc<dyn SessionAuthority>,
}

// ── Configuration, events, errors ─────────────────────────────────────────────

/// Tunables for the task loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause before re-polling a task the service reported as incomplete.
    pub poll_interval: Duration,
    /// Incomplete answers tolerated per task before the run fails.
    /// `None` keeps polling for as long as the service wants.
    pub max_incomplete_polls: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_incomplete_polls: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// The run was aborted; the string is the user-facing reason.
    Failed(String),
}

/// Position report emitted before each iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub run_id: Uuid,
    /// 1-based pass number.
    pub pass: u32,
    pub passes: u32,
    /// 0-based cursor position.
    pub index: usize,
    pub total: usize,
    pub task_id: String,
    pub task_name: String,
}

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Progress(Progress),
    Stopped { run_id: Uuid, outcome: RunOutcome },
}

/// Reasons a run refuses to start.  Nothing is spawned in these cases.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("please log in before starting a run")]
    NotAuthenticated,
    #[error("no device is connected")]
    NoDevice,
    #[error("the task queue is empty")]
    EmptyQueue,
    #[error("a run is already in progress")]
    AlreadyRunning,
}

/// Returned by queue edits attempted during a run.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the task queue cannot be edited while a run is active")]
pub struct QueueBusy;

/// Result of waiting for the worker to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The worker exited on its own.
    Joined,
    /// The worker did not exit within the limit and was aborted.
    TimedOut,
    /// The worker panicked; its drop guard still reported the stop.
    Panicked,
    /// There was no worker to wait for.
    Idle,
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct Worker {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the task queue against one device.
pub struct AutomationEngine {
    ports: EnginePorts,
    config: EngineConfig,
    queue: Arc<Mutex<TaskQueue>>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EngineEvent>,
    worker: Mutex<Option<Worker>>,
}

impl AutomationEngine {
    /// Creates an idle engine and the receiver for its events.
    pub fn new(
        ports: EnginePorts,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            ports,
            config,
            queue: Arc::new(Mutex::new(TaskQueue::new())),
            running: Arc::new(AtomicBool::new(false)),
            events,
            worker: Mutex::new(None),
        };
        (engine, rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Copy of the queue, including its cursor.
    pub fn queue_snapshot(&self) -> TaskQueue {
        lock(&self.queue).clone()
    }

    /// Applies `edit` to the queue unless a run is active.
    ///
    /// # Errors
    ///
    /// Returns [`QueueBusy`] while a run is in progress.
    pub fn edit_queue<R>(&self, edit: impl FnOnce(&mut TaskQueue) -> R) -> Result<R, QueueBusy> {
        let mut queue = lock(&self.queue);
        if self.is_running() {
            return Err(QueueBusy);
        }
        Ok(edit(&mut queue))
    }

    /// Starts a run on `device` and returns its id.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] without spawning anything when there is no valid
    /// session, no usable device, nothing queued, or a run is already active.
    pub fn start(&self, device: Option<Device>) -> Result<Uuid, StartError> {
        if !self.ports.auth.session().is_some_and(|s| s.is_valid()) {
            return Err(StartError::NotAuthenticated);
        }
        let device = device
            .filter(|d| !matches!(d.state, DeviceState::Offline | DeviceState::Unauthorized))
            .ok_or(StartError::NoDevice)?;
        {
            let queue = lock(&self.queue);
            if queue.is_empty() {
                return Err(StartError::EmptyQueue);
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(StartError::AlreadyRunning);
            }
        }

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let span = info_span!("automation_run", %run_id, device = %device.serial);
        let run = Run {
            run_id,
            device,
            ports: self.ports.clone(),
            config: self.config.clone(),
            queue: Arc::clone(&self.queue),
            cancel: cancel.clone(),
            events: self.events.clone(),
        };
        let mut guard = RunGuard {
            run_id,
            running: Arc::clone(&self.running),
            events: self.events.clone(),
            outcome: None,
        };

        let handle = tokio::spawn(
            async move {
                info!("automation run started");
                let outcome = run.execute().await;
                guard.outcome = Some(outcome);
            }
            .instrument(span),
        );

        *lock(&self.worker) = Some(Worker {
            run_id,
            cancel,
            handle,
        });
        Ok(run_id)
    }

    /// Asks the current run to stop at its next loop boundary.
    pub fn request_stop(&self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            info!(run_id = %worker.run_id, "stop requested");
            worker.cancel.cancel();
        }
    }

    /// Waits for the current run to end on its own.
    pub async fn wait(&self) -> JoinOutcome {
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => join_worker(worker, None).await,
            None => JoinOutcome::Idle,
        }
    }

    /// Cancels the current run and waits at most `limit` for it to exit.
    ///
    /// A worker that overruns the limit is aborted and reported as
    /// [`JoinOutcome::TimedOut`]; this is logged, not treated as an error.
    pub async fn shutdown(&self, limit: Duration) -> JoinOutcome {
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => {
                worker.cancel.cancel();
                join_worker(worker, Some(limit)).await
            }
            None => JoinOutcome::Idle,
        }
    }
}

async fn join_worker(worker: Worker, limit: Option<Duration>) -> JoinOutcome {
    let Worker {
        run_id, mut handle, ..
    } = worker;

    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%run_id, ?limit, "automation worker did not stop in time; aborting it");
                handle.abort();
                return JoinOutcome::TimedOut;
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(()) => JoinOutcome::Joined,
        Err(e) if e.is_panic() => {
            error!(%run_id, "automation worker panicked");
            JoinOutcome::Panicked
        }
        Err(_) => JoinOutcome::Joined,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// Clears the running flag and reports the outcome however the worker exits.
struct RunGuard {
    run_id: Uuid,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EngineEvent>,
    outcome: Option<RunOutcome>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| RunOutcome::Failed("run terminated unexpectedly".to_string()));
        match &outcome {
            RunOutcome::Completed => info!(run_id = %self.run_id, "automation run completed"),
            RunOutcome::Cancelled => info!(run_id = %self.run_id, "automation run cancelled"),
            RunOutcome::Failed(reason) => {
                error!(run_id = %self.run_id, %reason, "automation run failed")
            }
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::Stopped {
            run_id: self.run_id,
            outcome,
        });
    }
}

/// Result of one sample → exchange → act round.
enum Step {
    Completed,
    Incomplete,
    Abort(String),
}

struct Run {
    run_id: Uuid,
    device: Device,
    ports: EnginePorts,
    config: EngineConfig,
    queue: Arc<Mutex<TaskQueue>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Run {
    async fn execute(&self) -> RunOutcome {
        let passes = lock(&self.queue).repeat_count();

        for pass in 1..=passes {
            lock(&self.queue).reset_cursor();
            info!(pass, passes, "starting pass");

            let mut completions = 0u32;
            let mut incomplete_polls = 0u32;

            loop {
                if self.cancel.is_cancelled() {
                    return RunOutcome::Cancelled;
                }

                let (task, index, total) = {
                    let queue = lock(&self.queue);
                    match queue.current() {
                        Some(task) => (task.clone(), queue.cursor(), queue.len()),
                        None => break,
                    }
                };

                if task.execute_once && pass > 1 {
                    debug!(task = task.id(), "skipping run-once task after first pass");
                    lock(&self.queue).advance();
                    continue;
                }

                let _ = self.events.send(EngineEvent::Progress(Progress {
                    run_id: self.run_id,
                    pass,
                    passes,
                    index,
                    total,
                    task_id: task.id().to_string(),
                    task_name: task.display_name().to_string(),
                }));

                match self.iterate(&task).await {
                    Step::Completed => {
                        incomplete_polls = 0;
                        completions += 1;
                        if completions < task.repeat {
                            info!(task = task.id(), completions, repeat = task.repeat, "task repetition complete");
                            continue;
                        }
                        completions = 0;
                        info!(task = task.id(), "task complete");
                        if self.cancel.is_cancelled() {
                            return RunOutcome::Cancelled;
                        }
                        lock(&self.queue).advance();
                    }
                    Step::Incomplete => {
                        incomplete_polls += 1;
                        if let Some(cap) = self.config.max_incomplete_polls {
                            if incomplete_polls > cap {
                                return RunOutcome::Failed(format!(
                                    "task '{}' still incomplete after {} polls",
                                    task.display_name(),
                                    incomplete_polls
                                ));
                            }
                        }
                        tokio::select! {
                            _ = self.cancel.cancelled() => return RunOutcome::Cancelled,
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                        }
                    }
                    Step::Abort(reason) => return RunOutcome::Failed(reason),
                }
            }
        }

        RunOutcome::Completed
    }

    async fn iterate(&self, task: &TaskInstance) -> Step {
        let Some(frame) = self.ports.sampler.sample(&self.device).await else {
            return Step::Abort("screen capture failed".to_string());
        };
        let Some(metadata) = self.ports.sampler.device_info(&self.device).await else {
            return Step::Abort("device metadata unavailable".to_string());
        };
        let image = BASE64.encode(&frame);
        let variables = task.variables();
        let mut reauthenticated = false;

        loop {
            let Some(session) = self.ports.auth.session().filter(AuthSession::is_valid) else {
                return Step::Abort("not authenticated".to_string());
            };

            let request = json!({
                "user_id": session.user_id,
                "session_id": session.session_id,
                "device_image": image.clone(),
                "current_task": task.id(),
                "task_variables": variables.clone(),
                "device_info": metadata.to_json(),
            });

            debug!(task = task.id(), "sending process_image request");
            let Some(raw) = self
                .ports
                .exchanger
                .exchange(endpoints::PROCESS_IMAGE, request)
                .await
            else {
                return Step::Abort("no response from server".to_string());
            };

            let response = match ServerResponse::from_value(raw) {
                Ok(r) => r,
                Err(e) => return Step::Abort(format!("malformed server response: {e}")),
            };

            if !response.is_success() {
                if response.error_kind() == Some(ErrorKind::SessionExpired) && !reauthenticated {
                    reauthenticated = true;
                    warn!("session expired; re-authenticating");
                    match self.ports.auth.reauthenticate().await {
                        Ok(_) => continue,
                        Err(e) => return Step::Abort(format!("re-authentication failed: {e}")),
                    }
                }
                return Step::Abort(format!("server error: {}", response.reason()));
            }

            let actions = match parse_actions(response.field("touch_actions")) {
                Ok(actions) => actions,
                Err(e) => return Step::Abort(format!("unusable touch actions: {e}")),
            };
            if !actions.is_empty() {
                debug!(count = actions.len(), "performing touch actions");
                if let Err(e) = self.ports.actuator.perform(&self.device, &actions).await {
                    return Step::Abort(format!("touch execution failed: {e}"));
                }
            }

            let completed = response
                .field("task_completed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return if completed {
                Step::Completed
            } else {
                Step::Incomplete
            };
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use ark_core::{TaskDefinition, TaskInstance};
    use tokio::sync::Notify;

    // ── Fakes ─────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeSampler {
        samples: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScreenSampler for FakeSampler {
        async fn sample(&self, _device: &Device) -> Option<Vec<u8>> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            (!self.fail).then(|| vec![0xFF, 0xD8, 0xFF])
        }

        async fn device_info(&self, _device: &Device) -> Option<DeviceMetadata> {
            Some(DeviceMetadata {
                resolution: Resolution::new(1080, 1920),
                model: "Pixel".into(),
            })
        }
    }

    /// Replies from a script; the last reply repeats once the script runs out.
    struct ScriptedExchanger {
        replies: Mutex<VecDeque<Option<Value>>>,
        last: Mutex<Option<Value>>,
        requests: Mutex<Vec<Value>>,
        pause_on: Option<usize>,
        entered: Notify,
        release: Notify,
    }

    impl ScriptedExchanger {
        fn new(replies: Vec<Option<Value>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                pause_on: None,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        fn pausing_on(mut self, request_number: usize) -> Self {
            self.pause_on = Some(request_number);
            self
        }

        fn request_count(&self) -> usize {
            lock(&self.requests).len()
        }
    }

    #[async_trait]
    impl RequestExchanger for ScriptedExchanger {
        async fn exchange(&self, _endpoint: &str, data: Value) -> Option<Value> {
            let n = {
                let mut requests = lock(&self.requests);
                requests.push(data);
                requests.len()
            };
            if self.pause_on == Some(n) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            let next = lock(&self.replies).pop_front();
            match next {
                Some(reply) => {
                    *lock(&self.last) = reply.clone();
                    reply
                }
                None => lock(&self.last).clone(),
            }
        }
    }

    #[derive(Default)]
    struct RecordingActuator {
        performed: Mutex<Vec<Vec<TouchAction>>>,
        should_fail: bool,
    }

    #[async_trait]
    impl TouchActuator for RecordingActuator {
        async fn perform(
            &self,
            _device: &Device,
            actions: &[TouchAction],
        ) -> Result<(), ActuationError> {
            if self.should_fail {
                return Err(ActuationError::Device("socket closed".into()));
            }
            lock(&self.performed).push(actions.to_vec());
            Ok(())
        }
    }

    struct FakeAuthority {
        session: Mutex<Option<AuthSession>>,
        reauths: AtomicUsize,
        reauth_fails: bool,
    }

    impl FakeAuthority {
        fn logged_in() -> Self {
            Self {
                session: Mutex::new(Some(AuthSession::new("doctor", "s-0"))),
                reauths: AtomicUsize::new(0),
                reauth_fails: false,
            }
        }
    }

    #[async_trait]
    impl SessionAuthority for FakeAuthority {
        fn session(&self) -> Option<AuthSession> {
            lock(&self.session).clone()
        }

        async fn reauthenticate(&self) -> Result<AuthSession, AuthError> {
            let n = self.reauths.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reauth_fails {
                return Err(AuthError::NoCredential);
            }
            let session = AuthSession::new("doctor", format!("s-{n}"));
            *lock(&self.session) = Some(session.clone());
            Ok(session)
        }
    }

    struct Harness {
        engine: AutomationEngine,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        sampler: Arc<FakeSampler>,
        exchanger: Arc<ScriptedExchanger>,
        actuator: Arc<RecordingActuator>,
        auth: Arc<FakeAuthority>,
    }

    fn harness_with(
        exchanger: ScriptedExchanger,
        sampler: FakeSampler,
        actuator: RecordingActuator,
        auth: FakeAuthority,
        config: EngineConfig,
    ) -> Harness {
        let sampler = Arc::new(sampler);
        let exchanger = Arc::new(exchanger);
        let actuator = Arc::new(actuator);
        let auth = Arc::new(auth);
        let ports = EnginePorts {
            sampler: sampler.clone(),
            exchanger: exchanger.clone(),
            actuator: actuator.clone(),
            auth: auth.clone(),
        };
        let (engine, events) = AutomationEngine::new(ports, config);
        Harness {
            engine,
            events,
            sampler,
            exchanger,
            actuator,
            auth,
        }
    }

    fn harness(exchanger: ScriptedExchanger) -> Harness {
        harness_with(
            exchanger,
            FakeSampler::default(),
            RecordingActuator::default(),
            FakeAuthority::logged_in(),
            fast_config(),
        )
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(1),
            max_incomplete_polls: None,
        }
    }

    fn device() -> Device {
        let mut d = Device::new("emulator-5554");
        d.state = DeviceState::Online;
        d
    }

    fn fill_queue(engine: &AutomationEngine, n: usize) {
        engine
            .edit_queue(|q| {
                for i in 0..n {
                    q.push(TaskInstance::new(TaskDefinition::new(
                        format!("task-{i}"),
                        format!("Task {i}"),
                    )));
                }
            })
            .unwrap();
    }

    fn complete() -> Option<Value> {
        Some(json!({"status": "success", "data": {"touch_actions": [], "task_completed": true}}))
    }

    fn incomplete() -> Option<Value> {
        Some(json!({"status": "success", "data": {"touch_actions": [], "task_completed": false}}))
    }

    fn expired() -> Option<Value> {
        Some(json!({"status": "error", "error_type": "session_expired", "message": "会话已过期"}))
    }

    async fn stopped_outcome(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> RunOutcome {
        while let Some(event) = events.recv().await {
            if let EngineEvent::Stopped { outcome, .. } = event {
                return outcome;
            }
        }
        panic!("event channel closed without a Stopped event");
    }

    // ── Preconditions ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_requires_session() {
        // Arrange
        let auth = FakeAuthority::logged_in();
        *lock(&auth.session) = None;
        let h = harness_with(
            ScriptedExchanger::new(vec![]),
            FakeSampler::default(),
            RecordingActuator::default(),
            auth,
            fast_config(),
        );
        fill_queue(&h.engine, 1);

        // Act
        let result = h.engine.start(Some(device()));

        // Assert
        assert_eq!(result, Err(StartError::NotAuthenticated));
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_start_requires_usable_device_and_tasks() {
        let h = harness(ScriptedExchanger::new(vec![]));

        assert_eq!(h.engine.start(Some(device())), Err(StartError::EmptyQueue));
        fill_queue(&h.engine, 1);
        assert_eq!(h.engine.start(None), Err(StartError::NoDevice));
        let mut offline = device();
        offline.state = DeviceState::Offline;
        assert_eq!(h.engine.start(Some(offline)), Err(StartError::NoDevice));
        assert_eq!(h.exchanger.request_count(), 0);
    }

    #[tokio::test]
    async fn test_second_start_and_queue_edit_rejected_while_running() {
        // Arrange
        let mut h = harness(ScriptedExchanger::new(vec![complete()]).pausing_on(1));
        fill_queue(&h.engine, 1);
        tokio_test::assert_ok!(h.engine.start(Some(device())));
        h.exchanger.entered.notified().await;

        // Act
        let second = h.engine.start(Some(device()));
        let edit = h.engine.edit_queue(|q| q.clear());

        // Assert
        assert_eq!(second, Err(StartError::AlreadyRunning));
        assert_eq!(edit, Err(QueueBusy));

        h.exchanger.release.notify_one();
        assert_eq!(stopped_outcome(&mut h.events).await, RunOutcome::Completed);
        assert_eq!(h.engine.wait().await, JoinOutcome::Joined);
        tokio_test::assert_ok!(h.engine.edit_queue(|q| q.len()));
    }

    // ── Loop behaviour ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_three_complete_tasks_issue_three_requests() {
        // Arrange
        let mut h = harness(ScriptedExchanger::new(vec![complete()]));
        fill_queue(&h.engine, 3);

        // Act
        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        // Assert
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.exchanger.request_count(), 3);
        assert_eq!(h.engine.wait().await, JoinOutcome::Joined);
        assert!(!h.engine.is_running());
        assert_eq!(h.engine.queue_snapshot().cursor(), 3);
    }

    #[tokio::test]
    async fn test_requests_carry_task_context() {
        let mut h = harness(ScriptedExchanger::new(vec![complete()]));
        h.engine
            .edit_queue(|q| {
                let mut task = TaskInstance::new(TaskDefinition::new("daily", "Daily"));
                task.overrides.insert("stage".into(), json!("1-7"));
                q.push(task);
            })
            .unwrap();

        h.engine.start(Some(device())).unwrap();
        stopped_outcome(&mut h.events).await;

        let requests = lock(&h.exchanger.requests);
        let req = &requests[0];
        assert_eq!(req["user_id"], "doctor");
        assert_eq!(req["session_id"], "s-0");
        assert_eq!(req["current_task"], "daily");
        assert_eq!(req["task_variables"]["stage"], "1-7");
        assert_eq!(req["device_info"]["resolution"], json!([1080, 1920]));
        assert_eq!(req["device_image"], BASE64.encode([0xFF, 0xD8, 0xFF]));
    }

    #[tokio::test]
    async fn test_progress_events_report_position() {
        let mut h = harness(ScriptedExchanger::new(vec![complete()]));
        fill_queue(&h.engine, 2);

        h.engine.start(Some(device())).unwrap();
        let mut progress = Vec::new();
        while let Some(event) = h.events.recv().await {
            match event {
                EngineEvent::Progress(p) => progress.push((p.index, p.total, p.task_name)),
                EngineEvent::Stopped { .. } => break,
            }
        }

        assert_eq!(
            progress,
            vec![(0, 2, "Task 0".to_string()), (1, 2, "Task 1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_session_expiry_retries_exactly_once() {
        // Arrange
        let mut h = harness(ScriptedExchanger::new(vec![expired()]));
        fill_queue(&h.engine, 1);

        // Act
        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        // Assert
        assert!(matches!(outcome, RunOutcome::Failed(ref r) if r.contains("会话已过期")));
        assert_eq!(h.exchanger.request_count(), 2);
        assert_eq!(h.auth.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(h.sampler.samples.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_expiry_retry_uses_fresh_session() {
        let mut h = harness(ScriptedExchanger::new(vec![expired(), complete()]));
        fill_queue(&h.engine, 1);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert_eq!(outcome, RunOutcome::Completed);
        let requests = lock(&h.exchanger.requests);
        assert_eq!(requests[0]["session_id"], "s-0");
        assert_eq!(requests[1]["session_id"], "s-1");
        assert_eq!(requests[0]["device_image"], requests[1]["device_image"]);
    }

    #[tokio::test]
    async fn test_failed_reauthentication_aborts_run() {
        let mut auth = FakeAuthority::logged_in();
        auth.reauth_fails = true;
        let mut h = harness_with(
            ScriptedExchanger::new(vec![expired()]),
            FakeSampler::default(),
            RecordingActuator::default(),
            auth,
            fast_config(),
        );
        fill_queue(&h.engine, 1);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert!(matches!(outcome, RunOutcome::Failed(ref r) if r.starts_with("re-authentication failed")));
        assert_eq!(h.exchanger.request_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_call_prevents_further_requests() {
        // Arrange
        let mut h = harness(ScriptedExchanger::new(vec![complete()]).pausing_on(2));
        fill_queue(&h.engine, 3);
        h.engine.start(Some(device())).unwrap();
        h.exchanger.entered.notified().await;

        // Act
        h.engine.request_stop();
        h.exchanger.release.notify_one();
        let outcome = stopped_outcome(&mut h.events).await;

        // Assert
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(h.exchanger.request_count(), 2);
        assert_eq!(h.engine.queue_snapshot().cursor(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_task_is_polled_until_complete() {
        let mut h = harness(ScriptedExchanger::new(vec![incomplete(), incomplete(), complete()]));
        fill_queue(&h.engine, 1);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.exchanger.request_count(), 3);
        assert_eq!(h.sampler.samples.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_incomplete_poll_cap_aborts_run() {
        let config = EngineConfig {
            max_incomplete_polls: Some(1),
            ..fast_config()
        };
        let mut h = harness_with(
            ScriptedExchanger::new(vec![incomplete()]),
            FakeSampler::default(),
            RecordingActuator::default(),
            FakeAuthority::logged_in(),
            config,
        );
        fill_queue(&h.engine, 1);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(h.exchanger.request_count(), 2);
    }

    #[tokio::test]
    async fn test_no_response_aborts_without_retry() {
        let mut h = harness(ScriptedExchanger::new(vec![None]));
        fill_queue(&h.engine, 2);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert_eq!(outcome, RunOutcome::Failed("no response from server".into()));
        assert_eq!(h.exchanger.request_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_failure_aborts_before_request() {
        let mut h = harness_with(
            ScriptedExchanger::new(vec![complete()]),
            FakeSampler {
                fail: true,
                ..FakeSampler::default()
            },
            RecordingActuator::default(),
            FakeAuthority::logged_in(),
            fast_config(),
        );
        fill_queue(&h.engine, 1);

        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        assert_eq!(outcome, RunOutcome::Failed("screen capture failed".into()));
        assert_eq!(h.exchanger.request_count(), 0);
    }

    #[tokio::test]
    async fn test_touch_actions_are_performed_and_failure_aborts() {
        // Arrange
        let reply = Some(json!({"status": "success", "data": {
            "touch_actions": [{"action": "click", "coordinates": [0.5, 0.5]}],
            "task_completed": true
        }}));
        let mut ok = harness(ScriptedExchanger::new(vec![reply.clone()]));
        fill_queue(&ok.engine, 1);
        let mut failing = harness_with(
            ScriptedExchanger::new(vec![reply]),
            FakeSampler::default(),
            RecordingActuator {
                should_fail: true,
                ..RecordingActuator::default()
            },
            FakeAuthority::logged_in(),
            fast_config(),
        );
        fill_queue(&failing.engine, 2);

        // Act
        ok.engine.start(Some(device())).unwrap();
        let ok_outcome = stopped_outcome(&mut ok.events).await;
        failing.engine.start(Some(device())).unwrap();
        let failed_outcome = stopped_outcome(&mut failing.events).await;

        // Assert
        assert_eq!(ok_outcome, RunOutcome::Completed);
        assert_eq!(lock(&ok.actuator.performed).len(), 1);
        assert!(matches!(failed_outcome, RunOutcome::Failed(ref r) if r.starts_with("touch execution failed")));
        assert_eq!(failing.exchanger.request_count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_counts_and_run_once_tasks() {
        // Arrange
        let mut h = harness(ScriptedExchanger::new(vec![complete()]));
        h.engine
            .edit_queue(|q| {
                let mut once = TaskInstance::new(TaskDefinition::new("login-bonus", "Login bonus"));
                once.execute_once = true;
                let mut twice = TaskInstance::new(TaskDefinition::new("farm", "Farm"));
                twice.set_repeat(2).unwrap();
                q.push(once);
                q.push(twice);
                q.set_repeat_count(2).unwrap();
            })
            .unwrap();

        // Act
        h.engine.start(Some(device())).unwrap();
        let outcome = stopped_outcome(&mut h.events).await;

        // Assert: pass 1 = once + farm x2, pass 2 = farm x2
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.exchanger.request_count(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_wait() {
        let mut h = harness_with(
            ScriptedExchanger::new(vec![incomplete()]),
            FakeSampler::default(),
            RecordingActuator::default(),
            FakeAuthority::logged_in(),
            EngineConfig {
                poll_interval: Duration::from_secs(3600),
                max_incomplete_polls: None,
            },
        );
        fill_queue(&h.engine, 1);
        h.engine.start(Some(device())).unwrap();
        while h.exchanger.request_count() == 0 {
            tokio::task::yield_now().await;
        }

        let joined = h.engine.shutdown(Duration::from_secs(5)).await;

        assert_eq!(joined, JoinOutcome::Joined);
        assert_eq!(stopped_outcome(&mut h.events).await, RunOutcome::Cancelled);
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_call() {
        let mut h = harness(ScriptedExchanger::new(vec![complete()]).pausing_on(1));
        fill_queue(&h.engine, 1);
        h.engine.start(Some(device())).unwrap();
        h.exchanger.entered.notified().await;

        let joined = h.engine.shutdown(Duration::from_millis(50)).await;

        assert_eq!(joined, JoinOutcome::TimedOut);
        assert!(matches!(stopped_outcome(&mut h.events).await, RunOutcome::Failed(_)));
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_wait_without_run_is_idle() {
        let h = harness(ScriptedExchanger::new(vec![]));

        assert_eq!(h.engine.wait().await, JoinOutcome::Idle);
        assert_eq!(h.engine.shutdown(Duration::from_millis(10)).await, JoinOutcome::Idle);
    }
}
