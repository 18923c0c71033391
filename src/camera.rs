//! Camera frame source (camera feature)
//!
//! Frames are downscaled to at most 1024px and JPEG-encoded before they
//! enter the pipeline, keeping upstream payloads small.

#[cfg(feature = "camera")]
use crate::media::{DeviceError, EncodedFrame, FrameSource};
#[cfg(feature = "camera")]
use nokhwa::pixel_format::RgbFormat;
#[cfg(feature = "camera")]
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
#[cfg(feature = "camera")]
use nokhwa::Camera;

#[cfg(feature = "camera")]
const JPEG_QUALITY: u8 = 75;
#[cfg(feature = "camera")]
const MAX_DIMENSION: u32 = 1024;

#[cfg(feature = "camera")]
pub struct CameraGrabber {
    camera: Camera,
}

#[cfg(feature = "camera")]
impl CameraGrabber {
    pub fn new() -> Result<Self, DeviceError> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(CameraIndex::Index(0), requested)
            .map_err(|e| DeviceError::Unavailable(format!("camera: {}", e)))?;
        camera
            .open_stream()
            .map_err(|e| DeviceError::Unavailable(format!("camera: {}", e)))?;
        Ok(Self { camera })
    }
}

#[cfg(feature = "camera")]
impl FrameSource for CameraGrabber {
    fn capture(&mut self) -> Result<EncodedFrame, DeviceError> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| DeviceError::Read(format!("camera: {}", e)))?;
        let rgb = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| DeviceError::Read(format!("camera: decode: {}", e)))?;

        let img = image::DynamicImage::ImageRgb8(rgb).thumbnail(MAX_DIMENSION, MAX_DIMENSION);
        let mut jpeg = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
        encoder
            .encode(
                img.to_rgb8().as_raw(),
                img.width(),
                img.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| DeviceError::Read(format!("camera: jpeg encode: {}", e)))?;

        Ok(EncodedFrame {
            data: jpeg,
            mime_type: "image/jpeg",
        })
    }
}

#[cfg(not(feature = "camera"))]
pub struct CameraGrabber;

#[cfg(not(feature = "camera"))]
impl CameraGrabber {
    pub fn new() -> Result<Self, crate::media::DeviceError> {
        Err(crate::media::DeviceError::Unavailable(
            "camera feature not enabled".to_string(),
        ))
    }
}

#[cfg(not(feature = "camera"))]
impl crate::media::FrameSource for CameraGrabber {
    fn capture(&mut self) -> Result<crate::media::EncodedFrame, crate::media::DeviceError> {
        Err(crate::media::DeviceError::Unavailable(
            "camera feature not enabled".to_string(),
        ))
    }
}
