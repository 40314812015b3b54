//! Consumer pipeline
//!
//! Four activities per session: datagram receive + reassembly, rendering
//! with pointer handling, continuous intent transmission, and logging of the
//! angles the producer echoes back. Pointer drags over the rendered video
//! translate into gimbal set-points.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::FrameBuffer;
use crate::codec::{Packet, Reassembler};
use crate::compress;
use crate::control::{
    AngleState, ControlMessage, ControlReceiver, ControlSender, GimbalAngles, RECORD_SIZE,
};
use crate::data::DataChannel;
use crate::device::{Image, ImageCodec, PointerEvent, Surface};
use crate::session::ActivityError;
use crate::stats::LinkStats;

/// Consumer intent is pushed at this cadence whether or not it changed.
const INTENT_TX_PERIOD: Duration = Duration::from_millis(10);

/// Render loop cadence, roughly a 30 Hz display.
const RENDER_PERIOD: Duration = Duration::from_millis(33);

/// Translates pointer motion over the video into gimbal set-points.
///
/// A press anchors the gesture; each drag moves the angles by the difference
/// between the current and previous pointer positions, mapped so that a drag
/// across half the frame sweeps 90 degrees. The vertical delta saturates at
/// +40 before accumulation, matching the tilt axis limit.
#[derive(Debug)]
pub struct PointerTracker {
    half_width: f64,
    half_height: f64,
    anchor: Option<(f64, f64)>,
    current: GimbalAngles,
}

impl PointerTracker {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            half_width: width as f64 / 2.0,
            half_height: height as f64 / 2.0,
            anchor: None,
            current: GimbalAngles::CENTER,
        }
    }

    fn pointer_delta(&self, px: f64, py: f64) -> (f64, f64) {
        let dx = -(px - self.half_width) / self.half_width * 90.0;
        let dy = ((py - self.half_height) / self.half_height * 90.0).min(GimbalAngles::Y_MAX);
        (dx, dy)
    }

    /// Feeds one pointer event; returns the new intent when it moved.
    pub fn handle(&mut self, event: PointerEvent) -> Option<GimbalAngles> {
        match event {
            PointerEvent::Down { x, y } => {
                self.anchor = Some(self.pointer_delta(x, y));
                None
            }
            PointerEvent::Drag { x, y } => {
                let delta = self.pointer_delta(x, y);
                let Some(anchor) = self.anchor.replace(delta) else {
                    // drag with no press seen: anchor it and wait
                    return None;
                };

                let moved = GimbalAngles {
                    x: self.current.x + delta.0 - anchor.0,
                    y: self.current.y + delta.1 - anchor.1,
                }
                .clamped();
                self.current = moved;
                Some(moved)
            }
        }
    }

    pub fn current(&self) -> GimbalAngles {
        self.current
    }
}

/// Receives datagrams and feeds the reassembler; completed blobs land in the
/// frame buffer.
///
/// Unclassifiable datagrams and inconsistent frames are data loss, never
/// session failure.
pub async fn data_rx_activity(
    data: DataChannel,
    frame_buffer: Arc<FrameBuffer<Bytes>>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    let mut reassembler = Reassembler::new();

    loop {
        let datagram = tokio::select! {
            _ = token.cancelled() => break,
            datagram = data.recv() => datagram,
        };

        match datagram {
            Ok(datagram) => {
                stats.add_packet_received(datagram.len() as u64);
                let Some(packet) = Packet::from_bytes(datagram) else {
                    debug!("dropping unclassifiable datagram");
                    continue;
                };
                trace!(
                    salt = packet.trailer.salt,
                    index = packet.trailer.index,
                    total = packet.trailer.total,
                    "packet"
                );
                match reassembler.push(packet) {
                    Ok(Some(blob)) => {
                        frame_buffer.push(blob);
                        stats.add_frame_completed();
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "partial frame dropped"),
                }
            }
            Err(crate::data::DataError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    debug!("data rx stopped");
    Ok(())
}

/// Renders the freshest buffered frame and feeds pointer input back as
/// gimbal intent.
///
/// Corrupt frames are dropped silently (counted as loss) and the previous
/// image stays on screen. Pressing `q` cancels `quit` for a clean local
/// shutdown.
pub async fn render_activity(
    surface: Arc<Mutex<dyn Surface>>,
    frame_buffer: Arc<FrameBuffer<Bytes>>,
    image_codec: Arc<dyn ImageCodec>,
    mut tracker: PointerTracker,
    intent: Arc<AngleState>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
    quit: CancellationToken,
) -> Result<(), ActivityError> {
    let mut last_image: Option<Image> = None;
    let mut ticker = interval(RENDER_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(blob) = frame_buffer.pop_newest() {
            match decode_blob(&*image_codec, &blob) {
                Ok(image) => last_image = Some(image),
                Err(reason) => {
                    stats.add_frame_corrupt();
                    debug!(%reason, "dropping corrupt frame");
                }
            }
        }

        let mut surface = surface.lock().unwrap();
        if let Some(image) = &last_image {
            if let Err(e) = surface.show(image) {
                warn!(error = %e, "display surface gone, quitting");
                quit.cancel();
                return Ok(());
            }
        }

        for event in surface.poll_pointer() {
            if let Some(angles) = tracker.handle(event) {
                intent.set(angles);
            }
        }

        if surface.poll_key() == Some('q') {
            info!("stopped by keyboard control");
            quit.cancel();
            return Ok(());
        }
    }

    debug!("render stopped");
    Ok(())
}

fn decode_blob(image_codec: &dyn ImageCodec, blob: &[u8]) -> Result<Image, String> {
    let encoded = compress::inflate(blob).map_err(|e| format!("inflate: {e}"))?;
    image_codec
        .decode_jpeg(&encoded)
        .map_err(|e| format!("decode: {e}"))
}

/// Pushes the current intent to the producer at a fixed cadence.
pub async fn intent_tx_activity(
    mut tx: ControlSender,
    intent: Arc<AngleState>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
    quit: CancellationToken,
) -> Result<(), ActivityError> {
    let mut ticker = interval(INTENT_TX_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            _ = ticker.tick() => {}
        }

        match tx.send(intent.get()).await {
            Ok(()) => stats.add_control_bytes(RECORD_SIZE as u64),
            Err(crate::control::ControlError::Timeout) => continue,
            Err(e) => break Err(e.into()),
        }
    };

    // tell the producer we are going away on a deliberate quit
    if quit.is_cancelled() {
        tx.send_end_hint().await;
    }
    tx.close().await;
    debug!("intent tx stopped");
    result
}

/// Logs the angles the producer reports as applied.
pub async fn echo_rx_activity(
    mut rx: ControlReceiver,
    echoed: Arc<AngleState>,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> Result<(), ActivityError> {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => message,
        };

        match message {
            Ok(ControlMessage::Angles(angles)) => {
                stats.add_control_bytes(RECORD_SIZE as u64);
                debug!(%angles, "producer applied angles");
                echoed.set(angles);
            }
            Ok(ControlMessage::EndOfSession) => {
                info!("producer announced end of session");
            }
            Err(crate::control::ControlError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    debug!("echo rx stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drag_to(tracker: &mut PointerTracker, x: f64, y: f64) -> Option<GimbalAngles> {
        tracker.handle(PointerEvent::Drag { x, y })
    }

    #[test]
    fn test_pointer_center_press_is_neutral() {
        let mut tracker = PointerTracker::new(800, 600);
        assert!(tracker.handle(PointerEvent::Down { x: 400.0, y: 300.0 }).is_none());
        assert_eq!(tracker.current(), GimbalAngles::CENTER);
    }

    #[test]
    fn test_pointer_drag_accumulates() {
        let mut tracker = PointerTracker::new(800, 600);
        tracker.handle(PointerEvent::Down { x: 400.0, y: 300.0 });

        // quarter-frame drag left pans by +22.5 degrees
        let moved = drag_to(&mut tracker, 300.0, 300.0).unwrap();
        assert!((moved.x - 22.5).abs() < 1e-9);
        assert!((moved.y - 0.0).abs() < 1e-9);

        // dragging back to the anchor returns to neutral
        let back = drag_to(&mut tracker, 400.0, 300.0).unwrap();
        assert!((back.x - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_pointer_clamps_hold_everywhere() {
        // property: any sequence of in-bounds events keeps angles in range
        let mut tracker = PointerTracker::new(800, 600);
        tracker.handle(PointerEvent::Down { x: 0.0, y: 0.0 });

        let positions = [
            (799.0, 599.0),
            (0.0, 599.0),
            (799.0, 0.0),
            (400.0, 300.0),
            (0.0, 0.0),
            (799.0, 599.0),
            (13.0, 577.0),
        ];
        for (x, y) in positions {
            if let Some(angles) = drag_to(&mut tracker, x, y) {
                assert!((GimbalAngles::X_MIN..=GimbalAngles::X_MAX).contains(&angles.x));
                assert!((GimbalAngles::Y_MIN..=GimbalAngles::Y_MAX).contains(&angles.y));
            }
        }
    }

    #[test]
    fn test_pointer_drag_without_press_anchors() {
        let mut tracker = PointerTracker::new(800, 600);
        assert!(drag_to(&mut tracker, 100.0, 100.0).is_none());
        // next drag moves relative to the first position
        assert!(drag_to(&mut tracker, 120.0, 100.0).is_some());
    }

    #[test]
    fn test_pointer_tilt_saturates_before_accumulation() {
        let mut tracker = PointerTracker::new(800, 600);
        tracker.handle(PointerEvent::Down { x: 400.0, y: 300.0 });

        // full drag to the bottom edge: raw dy would be +90 but saturates at +40
        let moved = drag_to(&mut tracker, 400.0, 600.0).unwrap();
        assert!((moved.y - 40.0).abs() < 1e-9);
    }
}
