//! Session supervision
//!
//! A session couples one control connection and one data channel to a single
//! remote peer. The supervisors below own every resource a session touches
//! (sockets, camera, gimbal, buffers) and guarantee the coordinated reset:
//! when any channel or activity fails, the whole pipeline is cancelled, the
//! resources are released, and the endpoint returns to its listening or
//! connecting state.
//!
//! Producer states: `Idle → AwaitingControl → AwaitingData → Active →
//! Draining → Idle`. Any failure in a non-idle state routes through
//! `Draining`.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::FrameBuffer;
use crate::config::{Config, ConfigError};
use crate::consumer::{
    data_rx_activity, echo_rx_activity, intent_tx_activity, render_activity, PointerTracker,
};
use crate::control::{AngleState, ControlChannel, ControlError, ControlListener, GimbalAngles};
use crate::data::{DataChannel, DataError, DataListener};
use crate::device::{CameraSource, DeviceError, Gimbal, ImageCodec, Surface};
use crate::producer::{
    capture_activity, control_rx_activity, control_tx_activity, emit_activity,
    RAW_BUFFER_CAPACITY,
};
use crate::stats::{spawn_reporter, LinkStats};
use crate::SOCKET_TIMEOUT;

/// A drain that takes longer than this aborts the process.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer back-off between connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Why a pipeline activity stopped.
#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("camera unavailable: {0}")]
    Camera(DeviceError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Supervisor-fatal faults (bad configuration, unusable listen sockets).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingControl,
    AwaitingData,
    Active,
    Draining,
}

/// Producer-side supervisor: owns camera, gimbal and both server sockets.
pub struct ProducerSupervisor {
    config: Config,
    camera_source: Arc<dyn CameraSource>,
    gimbal: Arc<tokio::sync::Mutex<Box<dyn Gimbal>>>,
    image_codec: Arc<dyn ImageCodec>,
    state: SessionState,
}

impl ProducerSupervisor {
    pub fn new(
        config: Config,
        camera_source: Arc<dyn CameraSource>,
        gimbal: Box<dyn Gimbal>,
        image_codec: Arc<dyn ImageCodec>,
    ) -> Self {
        Self {
            config,
            camera_source,
            gimbal: Arc::new(tokio::sync::Mutex::new(gimbal)),
            image_codec,
            state: SessionState::Idle,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        info!(state = ?state, "producer session state");
    }

    /// Serves sessions until `shutdown` fires. Listeners are bound once and
    /// survive session resets.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let control_listener = ControlListener::bind(self.config.control_addr()?).await?;
        let data_listener = DataListener::bind(self.config.data_addr()?).await?;

        while !shutdown.is_cancelled() {
            self.set_state(SessionState::AwaitingControl);
            let control = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = control_listener.accept() => accepted?,
            };

            self.set_state(SessionState::AwaitingData);
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = timeout(SOCKET_TIMEOUT, data_listener.accept()) => accepted,
            };
            let (data, (width, height)) = match accepted {
                Ok(established) => established?,
                Err(_) => {
                    warn!("no data rendezvous in time, dropping control connection");
                    drop(control);
                    self.set_state(SessionState::Idle);
                    continue;
                }
            };

            self.set_state(SessionState::Active);
            self.run_active(control, data, width, height, &shutdown).await;
            self.set_state(SessionState::Idle);
        }

        info!("producer supervisor stopped");
        Ok(())
    }

    /// Runs one session to completion, including its drain.
    async fn run_active(
        &mut self,
        control: ControlChannel,
        data: DataChannel,
        width: u32,
        height: u32,
        shutdown: &CancellationToken,
    ) {
        let session = shutdown.child_token();
        let raw_buffer = Arc::new(FrameBuffer::new(RAW_BUFFER_CAPACITY));
        let angle_state = AngleState::new(GimbalAngles::CENTER);
        let stats = LinkStats::new();
        let (control_tx, control_rx) = control.split();

        let mut tasks: JoinSet<Result<(), ActivityError>> = JoinSet::new();
        tasks.spawn(capture_activity(
            Arc::clone(&self.camera_source),
            width,
            height,
            self.config.fps,
            Arc::clone(&raw_buffer),
            Arc::clone(&stats),
            session.clone(),
        ));
        tasks.spawn(emit_activity(
            Arc::clone(&raw_buffer),
            Arc::clone(&self.image_codec),
            data,
            self.config.max_packet_size,
            Arc::clone(&stats),
            session.clone(),
        ));
        tasks.spawn(control_rx_activity(
            control_rx,
            Arc::clone(&self.gimbal),
            Arc::clone(&angle_state),
            Arc::clone(&stats),
            session.clone(),
        ));
        tasks.spawn(control_tx_activity(
            control_tx,
            Arc::clone(&angle_state),
            Arc::clone(&stats),
            session.clone(),
        ));
        let reporter = spawn_reporter("producer", Arc::clone(&stats), session.clone());

        tokio::select! {
            _ = shutdown.cancelled() => info!("shutdown requested, ending session"),
            finished = tasks.join_next() => log_first_exit(finished),
        }

        self.set_state(SessionState::Draining);
        drain(&mut tasks, &session).await;
        let _ = reporter.await;

        raw_buffer.clear();
        if let Err(e) = self.gimbal.lock().await.apply(GimbalAngles::CENTER).await {
            warn!(error = %e, "failed to recenter gimbal");
        }
        info!("session drained");
    }
}

/// Consumer-side supervisor: owns the display surface and both client
/// sockets, reconnecting after resets until the user quits.
pub struct ConsumerSupervisor {
    config: Config,
    image_codec: Arc<dyn ImageCodec>,
    surface: Arc<Mutex<dyn Surface>>,
    state: SessionState,
}

impl ConsumerSupervisor {
    pub fn new(
        config: Config,
        image_codec: Arc<dyn ImageCodec>,
        surface: Arc<Mutex<dyn Surface>>,
    ) -> Self {
        Self {
            config,
            image_codec,
            surface,
            state: SessionState::Idle,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        info!(state = ?state, "consumer session state");
    }

    /// Connects and runs sessions until the user quits or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let control_addr = self.config.control_addr()?;
        let data_addr = self.config.data_addr()?;

        while !shutdown.is_cancelled() {
            self.set_state(SessionState::AwaitingControl);
            info!(peer = %control_addr, "connecting control channel");
            let control = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = ControlChannel::connect(control_addr) => match connected {
                    Ok(control) => control,
                    Err(e) => {
                        warn!(error = %e, "control connect failed, retrying");
                        self.set_state(SessionState::Idle);
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            self.set_state(SessionState::AwaitingData);
            let data = tokio::select! {
                _ = shutdown.cancelled() => break,
                established = DataChannel::rendezvous(
                    data_addr,
                    self.config.width,
                    self.config.height,
                ) => match established {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "data rendezvous failed, retrying");
                        drop(control);
                        self.set_state(SessionState::Idle);
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            self.set_state(SessionState::Active);
            let user_quit = self.run_active(control, data, &shutdown).await;
            self.set_state(SessionState::Idle);
            if user_quit {
                info!("consumer stopped by user");
                return Ok(());
            }
            sleep(RECONNECT_DELAY).await;
        }

        info!("consumer supervisor stopped");
        Ok(())
    }

    /// Runs one session; returns true when the user asked to quit.
    async fn run_active(
        &mut self,
        control: ControlChannel,
        data: DataChannel,
        shutdown: &CancellationToken,
    ) -> bool {
        let session = shutdown.child_token();
        let quit = CancellationToken::new();
        let frame_buffer = Arc::new(FrameBuffer::<Bytes>::new(self.config.buffer_capacity));
        let intent = AngleState::new(GimbalAngles::CENTER);
        let echoed = AngleState::new(GimbalAngles::CENTER);
        let stats = LinkStats::new();
        let (control_tx, control_rx) = control.split();
        let tracker = PointerTracker::new(self.config.width, self.config.height);

        let mut tasks: JoinSet<Result<(), ActivityError>> = JoinSet::new();
        tasks.spawn(data_rx_activity(
            data,
            Arc::clone(&frame_buffer),
            Arc::clone(&stats),
            session.clone(),
        ));
        tasks.spawn(render_activity(
            Arc::clone(&self.surface),
            Arc::clone(&frame_buffer),
            Arc::clone(&self.image_codec),
            tracker,
            Arc::clone(&intent),
            Arc::clone(&stats),
            session.clone(),
            quit.clone(),
        ));
        tasks.spawn(intent_tx_activity(
            control_tx,
            Arc::clone(&intent),
            Arc::clone(&stats),
            session.clone(),
            quit.clone(),
        ));
        tasks.spawn(echo_rx_activity(
            control_rx,
            Arc::clone(&echoed),
            Arc::clone(&stats),
            session.clone(),
        ));
        let reporter = spawn_reporter("consumer", Arc::clone(&stats), session.clone());

        tokio::select! {
            _ = shutdown.cancelled() => info!("shutdown requested, ending session"),
            _ = quit.cancelled() => info!("user quit, ending session"),
            finished = tasks.join_next() => log_first_exit(finished),
        }

        self.set_state(SessionState::Draining);
        drain(&mut tasks, &session).await;
        let _ = reporter.await;
        frame_buffer.clear();
        info!("session drained");

        quit.is_cancelled()
    }
}

fn log_first_exit(finished: Option<Result<Result<(), ActivityError>, tokio::task::JoinError>>) {
    match finished {
        Some(Ok(Ok(()))) => info!("pipeline activity finished, resetting session"),
        Some(Ok(Err(e))) => warn!(error = %e, "pipeline activity failed, resetting session"),
        Some(Err(e)) => error!(error = %e, "pipeline activity panicked"),
        None => {}
    }
}

/// Cancels the session and joins every activity, aborting the process if the
/// drain deadline is exceeded.
async fn drain(tasks: &mut JoinSet<Result<(), ActivityError>>, session: &CancellationToken) {
    session.cancel();

    let drained = timeout(DRAIN_TIMEOUT, async {
        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => info!(error = %e, "activity ended during drain"),
                Err(e) => error!(error = %e, "activity panicked during drain"),
            }
        }
    })
    .await;

    if drained.is_err() {
        error!(timeout = ?DRAIN_TIMEOUT, "session drain did not complete, aborting");
        std::process::abort();
    }
}
