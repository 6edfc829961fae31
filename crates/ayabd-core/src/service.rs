//! Knitting service
//!
//! One task owns the engine, the transport and the pattern queue. It waits on
//! transport input, the engine's deadline, the job retry and reconnect timers,
//! and commands from the control API, all in a single `select!` loop. API
//! commands arrive over a channel with a oneshot reply, so nothing is shared.

use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::{ApiCommand, ApiError, MachineSettings};
use crate::config::ServiceConfig;
use crate::pattern::{PatternQueue, PatternSource};
use crate::protocol::{
    AyabEngine, ConnectionSpec, EngineOutput, EngineStatus, ProtocolError, Transport,
    NEEDLE_COUNT,
};

/// Commands that may be queued before the service picks them up
const COMMAND_CHANNEL_SIZE: usize = 16;

struct ServiceRequest {
    command: ApiCommand,
    reply: oneshot::Sender<Result<Value, ApiError>>,
}

/// Cloneable access to a running [`KnitService`]
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<ServiceRequest>,
}

impl std::fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("command", &self.command)
            .finish()
    }
}

impl ServiceHandle {
    /// Execute a command in the service task and wait for its result
    pub async fn call(&self, command: ApiCommand) -> Result<Value, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ServiceRequest { command, reply })
            .await
            .map_err(|_| ApiError::ServiceUnavailable)?;
        response.await.map_err(|_| ApiError::ServiceUnavailable)?
    }
}

/// Machine status as reported by `GET /machine`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub connection: String,
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub simulation: bool,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn receive(transport: &mut Option<Transport>) -> Result<Vec<u8>, ProtocolError> {
    match transport {
        Some(transport) => transport.receive().await,
        None => std::future::pending().await,
    }
}

/// Drives knitting jobs from the pattern queue
pub struct KnitService {
    config: ServiceConfig,
    connection: ConnectionSpec,
    engine: AyabEngine,
    transport: Option<Transport>,
    connected_since: Option<DateTime<Utc>>,
    queue: PatternQueue,
    commands: mpsc::Receiver<ServiceRequest>,
    /// When to (re)start the knitting job
    retry_at: Option<Instant>,
    /// When to try opening the transport again
    reconnect_at: Option<Instant>,
}

impl KnitService {
    pub fn new(config: ServiceConfig) -> Result<(Self, ServiceHandle), ProtocolError> {
        Self::with_engine(config, AyabEngine::new())
    }

    /// Create the service around a preconfigured engine
    pub fn with_engine(
        config: ServiceConfig,
        engine: AyabEngine,
    ) -> Result<(Self, ServiceHandle), ProtocolError> {
        let connection = ConnectionSpec::parse(&config.connection)?;
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let service = Self {
            config,
            connection,
            engine,
            transport: None,
            connected_since: None,
            queue: PatternQueue::new(),
            commands,
            retry_at: None,
            reconnect_at: None,
        };
        Ok((service, ServiceHandle { commands: sender }))
    }

    /// Run until every [`ServiceHandle`] is dropped
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` completes or every [`ServiceHandle`] is dropped.
    /// The queue state is saved on the way out.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        if let Err(e) = self.queue.load_state(&self.config.state_dir) {
            warn!("Could not load queue state: {}", e);
        }
        self.connect().await;

        loop {
            let engine_deadline = self.engine.poll_timeout();
            tokio::select! {
                received = receive(&mut self.transport) => match received {
                    Ok(bytes) => self.engine.handle_input(&bytes, now(), &mut self.queue),
                    Err(e) => self.connection_lost(e),
                },
                _ = sleep_until(engine_deadline) => self.engine.handle_timeout(now()),
                _ = sleep_until(self.retry_at) => self.initiate_knitting(),
                _ = sleep_until(self.reconnect_at) => self.connect().await,
                request = self.commands.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                _ = &mut shutdown => break,
            }
            self.process_outputs().await;
            self.persist(false);
        }

        info!("Knitting service stopping");
        self.persist(true);
    }

    async fn connect(&mut self) {
        self.reconnect_at = None;
        match Transport::open(&self.connection).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.connected_since = Some(Utc::now());
                self.engine.transport_connected();
                // the controller reboots when the port opens
                self.retry_at = Some(now() + self.config.startup_delay());
            }
            Err(e) => {
                warn!("Cannot connect to AYAB at {}: {}", self.connection, e);
                self.reconnect_at = Some(now() + self.config.reconnect_delay());
            }
        }
    }

    fn connection_lost(&mut self, error: ProtocolError) {
        error!("AYAB connection lost: {}", error);
        self.transport = None;
        self.connected_since = None;
        self.engine.transport_lost();
        self.reconnect_at = Some(now() + self.config.reconnect_delay());
    }

    /// Start a job for the current queue width, centered on the bed
    fn initiate_knitting(&mut self) {
        self.retry_at = None;
        self.queue.reset_phase();
        let width = self.queue.width().min(usize::from(NEEDLE_COUNT)) as u16;
        let first_needle = (NEEDLE_COUNT / 2).saturating_sub(width / 2);
        if let Err(e) = self.engine.start_job(first_needle, width, now()) {
            warn!("Cannot start knitting job: {}", e);
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.config.job_retry_delay();
        debug!("Retrying knitting job in {:?}", delay);
        self.retry_at = Some(now() + delay);
    }

    async fn process_outputs(&mut self) {
        while let Some(output) = self.engine.poll_output() {
            match output {
                EngineOutput::Transmit(bytes) => self.transmit(&bytes).await,
                EngineOutput::SetResetLine(asserted) => {
                    if let Some(transport) = self.transport.as_mut() {
                        if let Err(e) = transport.set_reset_line(asserted) {
                            warn!("Cannot drive reset line: {}", e);
                        }
                    }
                }
                EngineOutput::JobFailed(e) => {
                    error!("Knitting job aborted: {}", e);
                    self.schedule_retry();
                }
                EngineOutput::JobCompleted { rows } => {
                    info!("Knitting job complete after {} rows", rows);
                }
                EngineOutput::RestartComplete => self.initiate_knitting(),
            }
        }
    }

    async fn transmit(&mut self, bytes: &[u8]) {
        let Some(transport) = self.transport.as_mut() else {
            debug!("Not connected, dropping {} bytes", bytes.len());
            return;
        };
        if let Err(e) = transport.send(bytes).await {
            self.connection_lost(e);
        }
    }

    fn persist(&mut self, force: bool) {
        if let Err(e) = self.queue.save_state(&self.config.state_dir, force) {
            error!("Could not save queue state: {}", e);
        }
    }

    fn handle_request(&mut self, request: ServiceRequest) {
        let result = self.execute(request.command);
        if request.reply.send(result).is_err() {
            debug!("API client went away before the reply");
        }
    }

    fn execute(&mut self, command: ApiCommand) -> Result<Value, ApiError> {
        match command {
            ApiCommand::GetQueue => Ok(serde_json::to_value(self.queue.view())?),
            ApiCommand::AddFile { path, web_url } => {
                let index = self.queue.append(PatternSource::File { path, web_url })?;
                Ok(json!({ "index": index }))
            }
            ApiCommand::AddSpacer { length } => {
                let index = self.queue.append(PatternSource::Spacer { length })?;
                Ok(json!({ "index": index }))
            }
            ApiCommand::RemoveEntry { index, delete_file } => {
                self.queue.remove(index, delete_file)?;
                Ok(serde_json::to_value(self.queue.view())?)
            }
            ApiCommand::GetCursor => Ok(serde_json::to_value(self.queue.cursor_view())?),
            ApiCommand::MoveCursor {
                position,
                relative,
                boundary,
            } => {
                self.queue.move_cursor(position, relative, boundary, false);
                Ok(serde_json::to_value(self.queue.cursor_view())?)
            }
            ApiCommand::GetMachine => Ok(serde_json::to_value(self.machine_view())?),
            ApiCommand::Restart => {
                if self.transport.is_none() {
                    return Err(ProtocolError::NotConnected.into());
                }
                self.retry_at = None;
                self.engine.restart(now());
                Ok(serde_json::to_value(self.machine_view())?)
            }
            ApiCommand::Configure(settings) => {
                self.configure(settings)?;
                Ok(serde_json::to_value(self.queue.view())?)
            }
            ApiCommand::Simulate { row, full_speed } => {
                let link = self
                    .transport
                    .as_mut()
                    .and_then(Transport::simulation_mut)
                    .ok_or(ApiError::NotSimulated)?;
                if let Some(full_speed) = full_speed {
                    link.set_full_speed(full_speed);
                }
                if row && !link.trigger_row() {
                    debug!("Simulated row request ignored, no job running");
                }
                Ok(serde_json::to_value(self.machine_view())?)
            }
        }
    }

    fn configure(&mut self, settings: MachineSettings) -> Result<(), ApiError> {
        if let Some(colors) = settings.colors {
            self.queue.set_colors(colors)?;
        }
        if let Some(width) = settings.width {
            self.queue.set_width(width)?;
        }
        if let Some(shift) = settings.shift {
            self.queue.set_shift(shift);
        }
        if let Some(ribber) = settings.ribber {
            self.queue.set_ribber(ribber);
        }
        Ok(())
    }

    fn machine_view(&self) -> MachineView {
        MachineView {
            engine: self.engine.status(),
            connection: self.connection.to_string(),
            connected: self.transport.is_some(),
            connected_since: self.connected_since,
            simulation: self.connection.is_simulation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    fn config(connection: &str, state_dir: &std::path::Path) -> ServiceConfig {
        ServiceConfig {
            connection: connection.to_string(),
            state_dir: state_dir.to_path_buf(),
            ..ServiceConfig::default()
        }
    }

    async fn machine(handle: &ServiceHandle) -> Value {
        handle.call(ApiCommand::GetMachine).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (service, handle) = KnitService::new(config("simulation", dir.path())).unwrap();
        let task = tokio::spawn(service.run());

        handle
            .call(ApiCommand::AddSpacer { length: 5 })
            .await
            .unwrap();
        handle
            .call(ApiCommand::Configure(MachineSettings {
                width: Some(20),
                ..MachineSettings::default()
            }))
            .await
            .unwrap();
        assert_eq!(machine(&handle).await["state"], "connected");

        // the job starts after the startup delay
        tokio::time::sleep(Duration::from_secs(4)).await;
        let status = machine(&handle).await;
        assert_eq!(status["state"], "knitting");
        assert_eq!(status["job"]["firstNeedle"], 90);
        assert_eq!(status["simulation"], true);

        // one manual row
        handle
            .call(ApiCommand::Simulate {
                row: true,
                full_speed: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(machine(&handle).await["rowCount"], 1);

        handle
            .call(ApiCommand::Simulate {
                row: false,
                full_speed: Some(true),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = machine(&handle).await;
        assert_eq!(status["state"], "ready");
        assert_eq!(status["rowCount"], 6);
        let cursor = handle.call(ApiCommand::GetCursor).await.unwrap();
        assert_eq!(cursor["position"], 5);
        assert_eq!(cursor["endOfPattern"], true);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_without_controller() {
        let dir = tempfile::tempdir().unwrap();
        let (service, handle) =
            KnitService::new(config("/dev/ayabd-test-missing", dir.path())).unwrap();
        let task = tokio::spawn(service.run());

        let status = machine(&handle).await;
        assert_eq!(status["state"], "offline");
        assert_eq!(status["connected"], false);
        assert!(status["connectedSince"].is_null());

        assert!(matches!(
            handle.call(ApiCommand::Restart).await,
            Err(ApiError::Protocol(ProtocolError::NotConnected))
        ));
        assert!(matches!(
            handle
                .call(ApiCommand::Simulate {
                    row: true,
                    full_speed: None
                })
                .await,
            Err(ApiError::NotSimulated)
        ));
        // queue commands work regardless
        let queue = handle
            .call(ApiCommand::AddSpacer { length: 3 })
            .await
            .unwrap();
        assert_eq!(queue["index"], 0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_saved_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (service, handle) = KnitService::new(config("simulation", dir.path())).unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(service.run_until(async {
            let _ = stopped.await;
        }));

        handle
            .call(ApiCommand::AddSpacer { length: 7 })
            .await
            .unwrap();
        handle
            .call(ApiCommand::MoveCursor {
                position: 2,
                relative: false,
                boundary: false,
            })
            .await
            .unwrap();
        stop.send(()).unwrap();
        task.await.unwrap();

        let mut queue = PatternQueue::new();
        queue.load_state(dir.path()).unwrap();
        assert_eq!(queue.total_length(), 7);
        assert_eq!(queue.cursor_position(), 2);

        // the handle outlives the service
        assert!(matches!(
            handle.call(ApiCommand::GetQueue).await,
            Err(ApiError::ServiceUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_starts_new_job() {
        let dir = tempfile::tempdir().unwrap();
        let (service, handle) = KnitService::new(config("simulation", dir.path())).unwrap();
        let task = tokio::spawn(service.run());

        handle
            .call(ApiCommand::AddSpacer { length: 2 })
            .await
            .unwrap();
        handle
            .call(ApiCommand::Configure(MachineSettings {
                width: Some(10),
                ..MachineSettings::default()
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(machine(&handle).await["state"], "knitting");

        handle.call(ApiCommand::Restart).await.unwrap();
        assert_eq!(machine(&handle).await["state"], "offline");

        // reset pulse, boot time, then the job starts again
        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = machine(&handle).await;
        assert_eq!(status["state"], "knitting");
        assert_eq!(status["rowCount"], 0);

        drop(handle);
        task.await.unwrap();
    }
}
