//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and conversion of raw capture buffers
//! into colour frames with a grayscale derivative for detection.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
