//! Async control handle
//!
//! [`StreamingEngine`] runs an [`Engine`] on a blocking task and talks to
//! it through a command channel. Every control call is answered by the loop
//! over a oneshot reply. State and progress are read from the snapshot the
//! loop publishes, and events fan out to registered listeners.

use super::{Command, Engine, EngineConfig, EngineSnapshot};
use crate::communication::{ConnectionParams, Transport};
use gcodestream_core::{
    thread_safe_rw_map, thread_safe_vec, EngineError, EngineEvent, EngineListener,
    EngineListenerHandle, EventDispatcher, Instruction, Progress, SessionState, ThreadSafeRw,
    ThreadSafeRwMap, ThreadSafeVec, TimestampedEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(10);

type ListenerMap = ThreadSafeRwMap<EngineListenerHandle, Arc<dyn EngineListener>>;

/// Cloneable handle to a running streaming engine
#[derive(Clone)]
pub struct StreamingEngine {
    commands: mpsc::Sender<Command>,
    snapshot: ThreadSafeRw<EngineSnapshot>,
    dispatcher: EventDispatcher,
    listeners: ListenerMap,
    tasks: ThreadSafeVec<JoinHandle<()>>,
}

impl StreamingEngine {
    /// Start an engine loop for `transport`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        let dispatcher = EventDispatcher::new(config.event_buffer.max(1));
        let engine = Engine::with_dispatcher(transport, config, dispatcher.clone());
        let snapshot = engine.snapshot();
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        let listeners: ListenerMap = thread_safe_rw_map();
        let fan_out = tokio::spawn(fan_out(dispatcher.subscribe(), listeners.clone()));
        let engine_loop = tokio::task::spawn_blocking(move || engine.run(rx));

        Self {
            commands,
            snapshot,
            dispatcher,
            listeners,
            tasks: thread_safe_vec(vec![engine_loop, fan_out]),
        }
    }

    /// Open `path` at `baud` and start the handshake
    pub async fn connect(&self, path: impl Into<String>, baud: u32) -> Result<(), EngineError> {
        self.connect_with(ConnectionParams::new(path, baud)).await
    }

    /// Open the transport with full connection parameters
    pub async fn connect_with(&self, params: ConnectionParams) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Connect { params, respond_to })
            .await
    }

    /// Close the transport, cancelling any job
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Disconnect { respond_to })
            .await
    }

    /// Load and start a job; returns the number of job lines
    pub async fn start_job<I>(&self, instructions: I) -> Result<usize, EngineError>
    where
        I: IntoIterator<Item = Instruction>,
    {
        let instructions: Vec<Instruction> = instructions.into_iter().collect();
        self.request(|respond_to| Command::StartJob {
            instructions,
            respond_to,
        })
        .await
    }

    /// Send an instruction ahead of the job lane
    pub async fn send_now(&self, instruction: impl Into<Instruction>) -> Result<(), EngineError> {
        let instruction = instruction.into();
        self.request(|respond_to| Command::SendNow {
            instruction,
            respond_to,
        })
        .await
    }

    /// Pause the job
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Pause { respond_to })
            .await
    }

    /// Resume the job
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Resume { respond_to })
            .await
    }

    /// Abort the job
    pub async fn abort(&self) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Abort { respond_to })
            .await
    }

    /// Leave `Errored`
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(|respond_to| Command::Reset { respond_to })
            .await
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.snapshot.read().state
    }

    /// Current job progress
    pub fn progress(&self) -> Progress {
        self.snapshot.read().progress
    }

    /// Full snapshot of the loop state
    pub fn snapshot(&self) -> EngineSnapshot {
        *self.snapshot.read()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.dispatcher.subscribe()
    }

    /// Register a listener for engine events
    pub fn register_listener(&self, listener: Arc<dyn EngineListener>) -> EngineListenerHandle {
        let handle = EngineListenerHandle::new();
        self.listeners.write().insert(handle.clone(), listener);
        tracing::debug!("Registered engine listener {}", handle.0);
        handle
    }

    /// Remove a previously registered listener
    pub fn unregister_listener(&self, handle: &EngineListenerHandle) -> bool {
        self.listeners.write().remove(handle).is_some()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Wait until the session reaches `target`
    ///
    /// Returns false if `timeout` elapses first or the engine stops.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut events = self.subscribe();
        if self.state() == target {
            return true;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TimestampedEvent {
                        event: EngineEvent::StateChanged(state),
                        ..
                    }) if state == target => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == target {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Wait until no line is awaiting acknowledgment
    ///
    /// Used after `abort` so the halt command reaches the device before the
    /// caller disconnects. Returns false if `timeout` elapses first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.snapshot().in_flight.is_none() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Disconnect and stop the engine loop
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (respond_to, reply) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { respond_to })
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        reply.await.map_err(|_| EngineError::EngineStopped)?;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    async fn request<T, F>(&self, make: F) -> Result<T, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    {
        let (respond_to, reply) = oneshot::channel();
        self.commands
            .send(make(respond_to))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        reply.await.map_err(|_| EngineError::EngineStopped)?
    }
}

async fn fan_out(mut events: broadcast::Receiver<TimestampedEvent>, listeners: ListenerMap) {
    loop {
        let stamped = match events.recv().await {
            Ok(stamped) => stamped,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Listener fan-out skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let targets: Vec<Arc<dyn EngineListener>> = listeners.read().values().cloned().collect();
        for listener in targets {
            match &stamped.event {
                EngineEvent::StateChanged(state) => listener.on_state_changed(*state).await,
                EngineEvent::Progress(progress) => listener.on_progress(*progress).await,
                EngineEvent::TemperatureReport(report) => listener.on_temperature(report).await,
                EngineEvent::Fatal(reason) => listener.on_fatal(reason).await,
                EngineEvent::JobComplete(progress) => listener.on_job_complete(*progress).await,
                EngineEvent::Message(message) => listener.on_message(message).await,
            }
        }
    }
}
