//! Producer pipeline
//!
//! Four activities run for the lifetime of one session, all observing the
//! session cancellation token:
//!
//! - capture: camera → raw-frame buffer (capacity 2, drop-oldest)
//! - emit: raw frame → encode → compress → fragment → data channel
//! - control RX: peer angles → gimbal actuator
//! - control TX: applied angles echoed back when they change

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::FrameBuffer;
use crate::codec;
use crate::compress;
use crate::control::{
    AngleState, ControlMessage, ControlReceiver, ControlSender, RECORD_SIZE,
};
use crate::data::DataChannel;
use crate::device::{Camera, CameraSource, Gimbal, ImageCodec, RawFrame};
use crate::session::ActivityError;
use crate::stats::LinkStats;

/// Only the latest raw frame matters for encoding, plus one in flight.
pub const RAW_BUFFER_CAPACITY: usize = 2;

/// Wait before reopening a failed camera.
const CAMERA_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Producer angle-echo scan period.
const CONTROL_TX_PERIOD: Duration = Duration::from_millis(100);

/// Poll period when the raw buffer is empty.
const BUFFER_POLL: Duration = Duration::from_millis(10);

/// Opens the camera, allowing one retry after a settling delay.
async fn open_camera(
    source: &dyn CameraSource,
    width: u32,
    height: u32,
    fps: u32,
) -> Result<Box<dyn Camera>, ActivityError> {
    match source.open(width, height, fps).await {
        Ok(camera) => Ok(camera),
        Err(e) => {
            warn!(error = %e, "camera open failed, retrying once");
            sleep(CAMERA_RETRY_DELAY).await;
            source
                .open(width, height, fps)
                .await
                .map_err(ActivityError::Camera)
        }
    }
}

/// Reads camera frames into the raw buffer at the configured rate.
///
/// One read failure closes and reopens the device; a second consecutive
/// failure surfaces `CameraUnavailable` and tears the session down. The
/// camera is released on every exit path.
pub async fn capture_activity(
    source: Arc<dyn CameraSource>,
    width: u32,
    height: u32,
    fps: u32,
    raw_buffer: Arc<FrameBuffer<RawFrame>>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    let mut camera = open_camera(&*source, width, height, fps).await?;
    info!(width, height, fps, "capture started");

    // floor on the capture cadence, in case the device free-runs
    let mut pacer = interval(Duration::from_secs(1) / fps);
    pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failed_once = false;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = pacer.tick() => {}
        }

        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = camera.read() => read,
        };

        match read {
            Ok(frame) => {
                failed_once = false;
                raw_buffer.push(frame);
                stats.add_frame_captured();
            }
            Err(e) if !failed_once => {
                failed_once = true;
                warn!(error = %e, "camera read failed, reopening");
                camera.close().await;

                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = sleep(CAMERA_RETRY_DELAY) => {}
                }
                camera = match source.open(width, height, fps).await {
                    Ok(camera) => camera,
                    Err(e) => return Err(ActivityError::Camera(e)),
                };
            }
            Err(e) => {
                camera.close().await;
                return Err(ActivityError::Camera(e));
            }
        }
    }

    camera.close().await;
    debug!("capture stopped");
    Ok(())
}

/// Encodes, compresses, fragments and sends frames from the raw buffer.
///
/// Per-frame faults (encode failure, fragmentation overflow) drop that frame
/// and continue; only an unrecoverable data-channel fault ends the activity.
pub async fn emit_activity(
    raw_buffer: Arc<FrameBuffer<RawFrame>>,
    image_codec: Arc<dyn ImageCodec>,
    data: DataChannel,
    max_packet_size: usize,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    loop {
        if token.is_cancelled() {
            break;
        }

        let frame = match raw_buffer.pop() {
            Some(frame) => frame,
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(BUFFER_POLL) => {}
                }
                continue;
            }
        };

        let encoded = match image_codec.encode_jpeg(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "dropping frame on encode failure");
                continue;
            }
        };
        let blob = compress::deflate(&encoded);

        let packets = match codec::fragment(blob, max_packet_size) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(error = %e, "dropping unfragmentable frame");
                continue;
            }
        };

        let bytes = data.send_packets(&packets).await?;
        stats.add_frame_sent(packets.len() as u64, bytes as u64);
    }

    debug!("emit stopped");
    Ok(())
}

/// Applies received angle set-points to the gimbal.
///
/// Receivers are idempotent: the actuator is only driven when the freshest
/// record differs from the last applied angles.
pub async fn control_rx_activity(
    mut rx: ControlReceiver,
    gimbal: Arc<tokio::sync::Mutex<Box<dyn Gimbal>>>,
    angle_state: Arc<AngleState>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    let mut applied = angle_state.get();

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => message,
        };

        match message {
            Ok(ControlMessage::Angles(angles)) => {
                stats.add_control_bytes(RECORD_SIZE as u64);
                let angles = angles.clamped();
                if angles.same_record(&applied) {
                    continue;
                }
                if let Err(e) = gimbal.lock().await.apply(angles).await {
                    // actuator fault is not a channel fault
                    warn!(error = %e, "gimbal refused set-point");
                    continue;
                }
                debug!(%angles, "gimbal moved");
                applied = angles;
                angle_state.set(angles);
            }
            Ok(ControlMessage::EndOfSession) => {
                info!("peer announced end of session");
            }
            Err(crate::control::ControlError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    debug!("control rx stopped");
    Ok(())
}

/// Echoes the applied angles to the peer whenever they change.
pub async fn control_tx_activity(
    mut tx: ControlSender,
    angle_state: Arc<AngleState>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    let mut ticker = interval(CONTROL_TX_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            _ = ticker.tick() => {}
        }

        if let Some(angles) = angle_state.take_changed() {
            match tx.send(angles).await {
                Ok(()) => stats.add_control_bytes(RECORD_SIZE as u64),
                Err(crate::control::ControlError::Timeout) => continue,
                Err(e) => break Err(e.into()),
            }
        }
    };

    tx.close().await;
    debug!("control tx stopped");
    result
}
