//! The offline model descriptor.
//!
//! The model loader and the on-device execution of the entry point are
//! external collaborators (an offline model library's concern); this crate
//! only needs the fixed shape contract the loader hands back once a model
//! is loaded.

/// Shape of one tensor: batch, height, width, channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl TensorShape {
    pub fn hwc(self) -> usize {
        self.h * self.w * self.c
    }
}

/// Per-tensor layout info a loaded model exposes.
#[derive(Debug, Clone, Copy)]
pub struct TensorLayout {
    pub shape: TensorShape,
    /// Byte stride between consecutive samples in this tensor on host
    /// memory. Not necessarily `hwc * size_of::<f32>()` — accelerators pad
    /// per-sample strides to their own alignment.
    pub host_batch_stride: usize,
    /// Same as `host_batch_stride` but for device memory.
    pub device_batch_stride: usize,
}

/// An offline model once loaded: immutable for the lifetime of the engine
/// that owns it.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub entry_point: String,
    pub inputs: Vec<TensorLayout>,
    pub outputs: Vec<TensorLayout>,
}

impl ModelDescriptor {
    /// The hardware batch size, taken from the first input tensor's `n`.
    ///
    /// Invariant: every input and output tensor shares the same `n` — a
    /// model with input tensors of differing batch dimensions is not
    /// representable by this descriptor and should fail to load.
    pub fn batch_size(&self) -> usize {
        self.inputs
            .first()
            .map(|t| t.shape.n)
            .unwrap_or(0)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Per-tensor `(base, stride)` pairs packed contiguously into one
    /// `IoResValue` backing allocation, in tensor order.
    pub fn input_layout(&self, device: bool, batchsize: usize) -> Vec<(usize, usize)> {
        packed_offsets(&self.inputs, device, batchsize)
    }

    pub fn output_layout(&self, device: bool, batchsize: usize) -> Vec<(usize, usize)> {
        packed_offsets(&self.outputs, device, batchsize)
    }
}

fn packed_offsets(tensors: &[TensorLayout], device: bool, batchsize: usize) -> Vec<(usize, usize)> {
    let mut base = 0;
    let mut offsets = Vec::with_capacity(tensors.len());
    for t in tensors {
        let stride = if device { t.device_batch_stride } else { t.host_batch_stride };
        offsets.push((base, stride));
        base += stride * batchsize;
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(n: usize) -> TensorLayout {
        TensorLayout {
            shape: TensorShape { n, h: 224, w: 224, c: 3 },
            host_batch_stride: 224 * 224 * 3 * 4,
            device_batch_stride: 224 * 224 * 4 * 4,
        }
    }

    #[test]
    fn batch_size_comes_from_first_input() {
        let model = ModelDescriptor {
            entry_point: "subnet0".into(),
            inputs: vec![layout(4)],
            outputs: vec![layout(4)],
        };
        assert_eq!(model.batch_size(), 4);
    }

    #[test]
    fn device_stride_may_differ_from_host_stride() {
        let layout = layout(4);
        assert_ne!(layout.host_batch_stride, layout.device_batch_stride);
    }

    #[test]
    fn input_layout_packs_tensors_contiguously() {
        let model = ModelDescriptor {
            entry_point: "subnet0".into(),
            inputs: vec![layout(4), layout(4)],
            outputs: vec![],
        };
        let offsets = model.input_layout(false, 4);
        assert_eq!(offsets[0], (0, 224 * 224 * 3 * 4));
        assert_eq!(offsets[1].0, offsets[0].1 * 4);
    }
}
