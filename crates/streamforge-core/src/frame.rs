//! The frame data model.
//!
//! `Frame` is the unit that flows through the pipeline. The inference core
//! only reads a handful of fields off it (format, dimensions, per-plane
//! pointers, the EOS flag) and appends to its object list; everything else
//! about decoding, colour management, and storage lifetime belongs to
//! collaborators outside this crate.

use std::fmt;

/// Maximum number of image planes a frame can carry (matches common YUV/RGB
/// layouts; packed formats use one, planar YUV 4:2:0 uses two).
pub const MAX_PLANES: usize = 6;

bitflags::bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u32 {
        /// End of stream: no further frames will arrive on this channel.
        const EOS = 1 << 0;
    }
}

/// Pixel format of a frame's planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, Cr before Cb (2 planes).
    Yuv420Nv21,
    /// Planar YUV 4:2:0, Cb before Cr (2 planes).
    Yuv420Nv12,
    /// Packed BGR (1 plane).
    Bgr24,
    /// Packed RGB (1 plane).
    Rgb24,
}

impl PixelFormat {
    /// Number of image planes this format is stored across.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 1,
            PixelFormat::Yuv420Nv12 | PixelFormat::Yuv420Nv21 => 2,
        }
    }
}

/// Which memory space a frame's plane pointers live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host (CPU) memory.
    Cpu,
    /// Accelerator memory, identified by ordinal device id.
    Accelerator(u32),
}

/// One image plane: an opaque address plus its byte stride.
///
/// The address is carried as `usize` rather than a raw pointer because a
/// `Frame` must be `Send` across producer/worker threads and the actual
/// memory (host or device) is owned by a collaborator outside this crate;
/// the inference core only ever computes offsets into it.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub ptr: usize,
    pub stride: usize,
}

/// A normalised bounding box, coordinates in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A scalar classification attribute attached to a detected object (e.g. a
/// vehicle colour, a face-recognition confidence).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribute {
    pub id: i32,
    pub value: i32,
    pub score: f32,
}

/// One object a post-processor decoded out of a model's output for a single
/// frame: a box, a label, and whatever attributes/features that post-proc
/// class knows how to produce.
#[derive(Debug, Clone, Default)]
pub struct DetectedObject {
    pub label: String,
    pub track_id: Option<String>,
    pub score: f32,
    pub bbox: BoundingBox,
    pub attributes: Vec<(String, Attribute)>,
    pub features: Vec<Vec<f32>>,
}

impl DetectedObject {
    pub fn add_attribute(&mut self, key: impl Into<String>, value: Attribute) {
        self.attributes.push((key.into(), value));
    }

    pub fn add_feature(&mut self, feature: Vec<f32>) {
        self.features.push(feature);
    }
}

/// A decoded video frame as the inference core sees it.
///
/// Invariant: once the core receives a frame, the producer does not mutate
/// it until the frame's result-waiting card (returned by the engine that
/// accepted it) completes.
#[derive(Clone)]
pub struct Frame {
    pub channel_idx: u32,
    pub stream_id: String,
    pub frame_id: u64,
    pub flags: FrameFlags,
    pub timestamp: i64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: [usize; MAX_PLANES],
    pub device: Device,
    pub planes: Vec<Plane>,
    pub objects: Vec<DetectedObject>,
}

impl Frame {
    pub fn new(stream_id: impl Into<String>, channel_idx: u32, frame_id: u64) -> Self {
        Self {
            channel_idx,
            stream_id: stream_id.into(),
            frame_id,
            flags: FrameFlags::empty(),
            timestamp: 0,
            format: PixelFormat::Yuv420Nv12,
            width: 0,
            height: 0,
            stride: [0; MAX_PLANES],
            device: Device::Cpu,
            planes: Vec::new(),
            objects: Vec::new(),
        }
    }

    pub fn eos(stream_id: impl Into<String>, channel_idx: u32) -> Self {
        let mut f = Self::new(stream_id, channel_idx, 0);
        f.flags |= FrameFlags::EOS;
        f
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(FrameFlags::EOS)
    }

    /// Number of bytes in the given plane, derived from stride/height and
    /// the 4:2:0 chroma subsampling for YUV formats.
    pub fn plane_bytes(&self, plane_idx: usize) -> usize {
        match (self.format, plane_idx) {
            (PixelFormat::Yuv420Nv12 | PixelFormat::Yuv420Nv21, 0) => {
                self.stride[0] * self.height as usize
            }
            (PixelFormat::Yuv420Nv12 | PixelFormat::Yuv420Nv21, 1) => {
                self.stride[1] * self.height as usize / 2
            }
            (PixelFormat::Bgr24 | PixelFormat::Rgb24, 0) => self.stride[0] * self.height as usize,
            _ => 0,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("channel_idx", &self.channel_idx)
            .field("frame_id", &self.frame_id)
            .field("flags", &self.flags)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_frame_carries_no_planes() {
        let f = Frame::eos("cam0", 0);
        assert!(f.is_eos());
        assert!(f.planes.is_empty());
    }

    #[test]
    fn plane_bytes_nv12() {
        let mut f = Frame::new("cam0", 0, 1);
        f.format = PixelFormat::Yuv420Nv12;
        f.height = 720;
        f.stride = [1280, 1280, 0, 0, 0, 0];
        assert_eq!(f.plane_bytes(0), 1280 * 720);
        assert_eq!(f.plane_bytes(1), 1280 * 720 / 2);
    }

    #[test]
    fn detected_object_accumulates_attributes_and_features() {
        let mut obj = DetectedObject::default();
        obj.add_attribute("color", Attribute { id: 1, value: 2, score: 0.9 });
        obj.add_feature(vec![0.1, 0.2]);
        assert_eq!(obj.attributes.len(), 1);
        assert_eq!(obj.features.len(), 1);
    }
}
