//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Number of mmap buffers queued with the driver while streaming.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0} — check `rollcall devices` and ROLLCALL_CAMERA")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy — another program is using the camera")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one compressed image per buffer.
    Mjpg,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }
}

/// Anything that yields camera frames one at a time.
///
/// The capture loop only sees this trait, so tests can drive it with
/// in-memory frames.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// `width`×`height`. The driver may negotiate a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept whatever supported format the driver settles on.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc} (need YUYV, MJPG, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming. Frames are read through the returned [`FrameStream`].
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(FrameStream { camera: self, stream })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

/// Convert a raw buffer to a frame based on the negotiated format.
fn decode(format: PixelFormat, buf: &[u8], w: u32, h: u32, sequence: u32) -> Result<Frame, CameraError> {
    let frame = match format {
        // Luma comes straight from the Y samples rather than back from RGB.
        PixelFormat::Yuyv => Frame::new(
            frame::yuyv_to_rgb(buf, w, h)?,
            gray_image(w, h, frame::yuyv_to_grayscale(buf, w, h)?)?,
            sequence,
        ),
        PixelFormat::Mjpg => Frame::from_rgb(frame::mjpeg_to_rgb(buf)?, sequence),
        PixelFormat::Grey => {
            let pixels = (w * h) as usize;
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Frame::from_gray(gray_image(w, h, buf[..pixels].to_vec())?, sequence)
        }
        PixelFormat::Y16 => Frame::from_gray(gray_image(w, h, frame::y16_to_grayscale(buf, w, h)?)?, sequence),
    };
    Ok(frame)
}

fn gray_image(width: u32, height: u32, data: Vec<u8>) -> Result<GrayImage, CameraError> {
    let actual = data.len();
    GrayImage::from_raw(width, height, data).ok_or(CameraError::Frame(frame::FrameError::InvalidLength {
        expected: (width * height) as usize,
        actual,
    }))
}

/// A running capture stream. Streaming stops when this is dropped.
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let camera = self.camera;
        decode(camera.pixel_format, buf, camera.width, camera.height, meta.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/nonexistent-video", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_decode_yuyv_keeps_luma_for_gray_plane() {
        let frame = decode(PixelFormat::Yuyv, &[16, 128, 235, 128], 2, 1, 9).unwrap();
        assert_eq!(frame.gray.as_raw(), &vec![16, 235]);
        assert_eq!(frame.color.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(frame.color.get_pixel(1, 0).0, [255, 255, 255]);
        assert_eq!(frame.sequence, 9);
    }

    #[test]
    fn test_decode_short_buffers() {
        assert!(matches!(
            decode(PixelFormat::Yuyv, &[16, 128], 2, 1, 0),
            Err(CameraError::Frame(_))
        ));
        assert!(matches!(
            decode(PixelFormat::Grey, &[1, 2, 3], 2, 2, 0),
            Err(CameraError::CaptureFailed(_))
        ));
    }

    #[test]
    fn test_gray_image_rejects_short_buffer() {
        assert!(gray_image(4, 4, vec![0; 3]).is_err());
        assert_eq!(gray_image(2, 2, vec![1, 2, 3, 4]).unwrap().get_pixel(1, 1)[0], 4);
    }
}
