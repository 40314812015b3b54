//! External collaborator interfaces
//!
//! The streaming core never touches hardware: the capture device, the servo
//! gimbal, the image codec and the display surface all enter through the
//! traits below. Binaries (and tests) supply implementations; the `synthetic`
//! module ships software-only ones so the full pipeline runs without any
//! camera attached.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::control::GimbalAngles;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("image encode failed: {0}")]
    Encode(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("gimbal fault: {0}")]
    Gimbal(String),

    #[error("display surface closed")]
    SurfaceClosed,
}

/// Opaque image buffer as delivered by the capture device.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Decoded, renderable image.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Opens capture devices with a requested geometry and rate.
#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn open(&self, width: u32, height: u32, fps: u32)
        -> Result<Box<dyn Camera>, DeviceError>;
}

/// One open capture device. `read` blocks on the hardware frame cadence.
#[async_trait]
pub trait Camera: Send {
    async fn read(&mut self) -> Result<RawFrame, DeviceError>;

    async fn close(&mut self);
}

/// Two-axis servo gimbal co-located with the camera.
#[async_trait]
pub trait Gimbal: Send {
    async fn apply(&mut self, angles: GimbalAngles) -> Result<(), DeviceError>;
}

/// Still-image codec pairing the producer's encoder with the consumer's
/// decoder.
pub trait ImageCodec: Send + Sync {
    fn encode_jpeg(&self, frame: &RawFrame) -> Result<Bytes, DeviceError>;

    fn decode_jpeg(&self, data: &[u8]) -> Result<Image, DeviceError>;
}

/// Pointer activity on the rendered video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down { x: f64, y: f64 },
    Drag { x: f64, y: f64 },
}

/// Window that displays frames and delivers input events.
pub trait Surface: Send {
    fn show(&mut self, image: &Image) -> Result<(), DeviceError>;

    fn poll_pointer(&mut self) -> Vec<PointerEvent>;

    fn poll_key(&mut self) -> Option<char>;
}

/// Software-only collaborator implementations.
pub mod synthetic {
    use super::*;
    use std::time::Duration;

    /// Generates a moving test pattern at the requested rate.
    pub struct SyntheticCameraSource;

    #[async_trait]
    impl CameraSource for SyntheticCameraSource {
        async fn open(
            &self,
            width: u32,
            height: u32,
            fps: u32,
        ) -> Result<Box<dyn Camera>, DeviceError> {
            if width == 0 || height == 0 || fps == 0 {
                return Err(DeviceError::CameraUnavailable(format!(
                    "cannot open {width}x{height}@{fps}"
                )));
            }
            debug!(width, height, fps, "synthetic camera open");
            Ok(Box::new(SyntheticCamera {
                width,
                height,
                interval: Duration::from_secs(1) / fps,
                frame_count: 0,
            }))
        }
    }

    pub struct SyntheticCamera {
        width: u32,
        height: u32,
        interval: Duration,
        frame_count: u64,
    }

    #[async_trait]
    impl Camera for SyntheticCamera {
        async fn read(&mut self) -> Result<RawFrame, DeviceError> {
            tokio::time::sleep(self.interval).await;

            // diagonal gradient sliding one step per frame
            let phase = self.frame_count as u32;
            self.frame_count += 1;
            let mut data = BytesMut::with_capacity((self.width * self.height) as usize);
            for y in 0..self.height {
                for x in 0..self.width {
                    data.put_u8(((x + y + phase) % 256) as u8);
                }
            }

            Ok(RawFrame {
                width: self.width,
                height: self.height,
                data: data.freeze(),
            })
        }

        async fn close(&mut self) {
            debug!(frames = self.frame_count, "synthetic camera closed");
        }
    }

    /// Records applied set-points instead of driving servos.
    #[derive(Default)]
    pub struct LoggingGimbal {
        pub applied: Vec<GimbalAngles>,
    }

    #[async_trait]
    impl Gimbal for LoggingGimbal {
        async fn apply(&mut self, angles: GimbalAngles) -> Result<(), DeviceError> {
            debug!(%angles, "gimbal set-point");
            self.applied.push(angles);
            Ok(())
        }
    }

    const FRAME_MAGIC: &[u8; 4] = b"GCF1";

    /// Length-checked passthrough standing in for a real JPEG codec.
    ///
    /// Encoded frames carry a small header so the decoder can verify the
    /// geometry and detect truncation the way a JPEG decoder would reject a
    /// corrupt scan.
    pub struct PassthroughCodec;

    impl ImageCodec for PassthroughCodec {
        fn encode_jpeg(&self, frame: &RawFrame) -> Result<Bytes, DeviceError> {
            let mut out = BytesMut::with_capacity(12 + frame.data.len());
            out.put_slice(FRAME_MAGIC);
            out.put_u32(frame.width);
            out.put_u32(frame.height);
            out.put_slice(&frame.data);
            Ok(out.freeze())
        }

        fn decode_jpeg(&self, data: &[u8]) -> Result<Image, DeviceError> {
            if data.len() < 12 || &data[..4] != FRAME_MAGIC {
                return Err(DeviceError::Decode("bad frame header".into()));
            }
            let width = u32::from_be_bytes(data[4..8].try_into().unwrap());
            let height = u32::from_be_bytes(data[8..12].try_into().unwrap());
            if data.len() - 12 != (width * height) as usize {
                return Err(DeviceError::Decode(format!(
                    "{} payload bytes for {width}x{height}",
                    data.len() - 12
                )));
            }
            Ok(Image {
                width,
                height,
                data: Bytes::copy_from_slice(&data[12..]),
            })
        }
    }

    /// Headless surface: counts frames, produces no input.
    #[derive(Default)]
    pub struct NullSurface {
        pub frames_shown: u64,
    }

    impl Surface for NullSurface {
        fn show(&mut self, image: &Image) -> Result<(), DeviceError> {
            self.frames_shown += 1;
            if self.frames_shown % 100 == 0 {
                debug!(
                    frames = self.frames_shown,
                    width = image.width,
                    height = image.height,
                    "rendered"
                );
            }
            Ok(())
        }

        fn poll_pointer(&mut self) -> Vec<PointerEvent> {
            Vec::new()
        }

        fn poll_key(&mut self) -> Option<char> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::*;
    use super::*;

    #[tokio::test]
    async fn test_synthetic_camera_geometry() {
        let mut camera = SyntheticCameraSource.open(32, 16, 1000).await.unwrap();
        let frame = camera.read().await.unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 16);
        assert_eq!(frame.data.len(), 32 * 16);
        camera.close().await;
    }

    #[tokio::test]
    async fn test_synthetic_camera_rejects_zero_geometry() {
        assert!(SyntheticCameraSource.open(0, 16, 30).await.is_err());
    }

    #[test]
    fn test_passthrough_codec_roundtrip() {
        let frame = RawFrame {
            width: 4,
            height: 2,
            data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
        };

        let encoded = PassthroughCodec.encode_jpeg(&frame).unwrap();
        let image = PassthroughCodec.decode_jpeg(&encoded).unwrap();

        assert_eq!(image.width, 4);
        assert_eq!(image.height, 2);
        assert_eq!(image.data, frame.data);
    }

    #[test]
    fn test_passthrough_codec_rejects_truncation() {
        let frame = RawFrame {
            width: 4,
            height: 2,
            data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
        };

        let encoded = PassthroughCodec.encode_jpeg(&frame).unwrap();
        assert!(PassthroughCodec
            .decode_jpeg(&encoded[..encoded.len() - 1])
            .is_err());
        assert!(PassthroughCodec.decode_jpeg(b"junk").is_err());
    }
}
