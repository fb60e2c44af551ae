//! Bilinear resize of the two spatial axes.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{StorageType, TensorRef};
use crate::worksize::{align_to, find_max_factor, WorkSize, RESIZE_TILE};

const LOCAL: u32 = 16;

#[derive(Debug, Clone, Default)]
pub struct ResizeBilinearParams {
    pub new_height: u32,
    pub new_width: u32,
    /// Map corner pixels onto corner pixels: scale is `(in - 1) / (out - 1)`.
    pub align_corners: bool,
    /// Infer the output shape and resize the output to it. When false the
    /// output must already have the inferred shape.
    pub android_nn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Flat,
    /// 32x32 to 512x512 in 16x16 output tiles.
    Tiled,
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    scale: (f32, f32),
    path: Path,
}

/// Bilinear resize of an NCHW tensor to a fixed height and width.
pub struct ResizeBilinear {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Source step per output pixel along one axis.
pub fn resize_scale(input: u32, output: u32, align_corners: bool) -> f32 {
    if align_corners && input > 1 && output > 1 {
        (input - 1) as f32 / (output - 1) as f32
    } else {
        input as f32 / output as f32
    }
}

fn kernel_name(
    precision: PrecisionType,
    storage: StorageType,
    align_corners: bool,
    in_hw: (u32, u32),
    out_hw: (u32, u32),
) -> KernelName {
    match precision {
        PrecisionType::Int8 => KernelName::new("resize_bilinear").signed(true),
        PrecisionType::UInt8 if align_corners && in_hw == (32, 32) && out_hw == (512, 512) => {
            KernelName::new("resize_bilinear_32_to_512")
        }
        p if p.is_float() && storage == StorageType::Texture => {
            KernelName::new("resize_bilinear_tflite")
        }
        _ => KernelName::new("resize_bilinear"),
    }
}

impl Operator for ResizeBilinear {
    type Params = ResizeBilinearParams;
    const KIND: OperatorKind = OperatorKind::ResizeBilinear;

    fn new(runtime: Arc<Runtime>, precision: PrecisionType) -> Self {
        Self {
            base: OperatorBase::new(Self::KIND, runtime, precision),
            bound: None,
        }
    }

    fn initialize(
        &mut self,
        inputs: &[TensorRef],
        outputs: &[TensorRef],
        params: &ResizeBilinearParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        if input.num_dims() != 4 {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!("input must be 4-D, got {:?}", input.dims()),
            ));
        }
        if params.new_height == 0 || params.new_width == 0 {
            return Err(RuntimeError::shape(
                Self::KIND,
                format!("target size {}x{}", params.new_height, params.new_width),
            ));
        }

        let [n, c, h, w] = nchw_of(Self::KIND, &input, "input")?;
        let (oh, ow) = (params.new_height, params.new_width);
        let out_dims = [n, c, oh, ow];
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let name = kernel_name(precision, input.storage(), params.align_corners, (h, w), (oh, ow));
        let path = if name.stem() == "resize_bilinear_32_to_512" {
            Path::Tiled
        } else {
            Path::Flat
        };
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        let scale = (
            resize_scale(h, oh, params.align_corners),
            resize_scale(w, ow, params.align_corners),
        );
        self.bound = Some(Bound {
            input,
            output,
            scale,
            path,
        });
        self.base.finish_initialize(vec![kernel]);
        Ok(())
    }

    fn execute(&mut self) -> Status {
        self.base.enter_execute()?;
        let result = self.enqueue();
        self.base.leave_execute(result)
    }

    fn release(&mut self) -> Status {
        self.bound = None;
        self.base.release()
    }

    fn state(&self) -> Lifecycle {
        self.base.state()
    }

    fn kernel_names(&self) -> Vec<String> {
        self.base.kernel_names()
    }
}

impl ResizeBilinear {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.input.total_size() == 0 {
            log::debug!("ResizeBilinear: empty input, nothing to enqueue");
            return Ok(());
        }
        let [_, _, in_h, in_w] = nchw_of(Self::KIND, &b.input, "input")?;
        let [n, c, out_h, out_w] = nchw_of(Self::KIND, &b.output, "output")?;
        let planes = n * c;

        let work = match b.path {
            Path::Tiled => {
                let tiles = planes * (out_h / RESIZE_TILE) * (out_w / RESIZE_TILE);
                // a full 16x16 group when the cap allows, fewer rows otherwise
                let cap = self.base.cap();
                let tile_x = find_max_factor(RESIZE_TILE, cap);
                let tile_y = find_max_factor(RESIZE_TILE, cap / tile_x);
                WorkSize::two_d(
                    [align_to(tiles, tile_x), RESIZE_TILE],
                    Some([tile_x, tile_y]),
                )
            }
            Path::Flat => {
                let local = self.base.local_size(LOCAL);
                WorkSize::one_d(align_to(planes * out_h * out_w, local), Some(local))
            }
        };
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(in_h)
            .u32(in_w)
            .u32(out_h)
            .u32(out_w)
            .f32(b.scale.0)
            .f32(b.scale.1)
            .u32(planes);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};
    use pretty_assertions::assert_eq;

    fn resize(
        rt: &Arc<Runtime>,
        precision: PrecisionType,
        input: TensorRef,
        params: &ResizeBilinearParams,
    ) -> (ResizeBilinear, TensorRef) {
        let output = rt
            .create_tensor(TensorDesc::new(&[1], precision.storage_type()))
            .unwrap();
        let mut op = ResizeBilinear::new(Arc::clone(rt), precision);
        op.initialize(&[input], &[Arc::clone(&output)], params).unwrap();
        op.execute().unwrap();
        rt.finish().unwrap();
        (op, output)
    }

    #[test]
    fn test_resize_scale() {
        assert_eq!(resize_scale(2, 3, true), 0.5);
        assert_eq!(resize_scale(2, 4, false), 0.5);
        assert_eq!(resize_scale(4, 1, true), 4.0);
    }

    #[test]
    fn test_align_corners_interpolates() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Float32)).unwrap();
        input.write(&[0.0f32, 1.0, 2.0, 3.0]).unwrap();
        let params = ResizeBilinearParams {
            new_height: 3,
            new_width: 3,
            align_corners: true,
            android_nn: true,
        };
        let (op, out) = resize(&rt, PrecisionType::Fp32, input, &params);
        assert_eq!(op.kernel_names(), vec!["resize_bilinear_FP32".to_string()]);
        assert_eq!(out.dims(), vec![1, 1, 3, 3]);
        assert_eq!(
            out.read::<f32>().unwrap(),
            vec![0.0, 0.5, 1.0, 1.0, 1.5, 2.0, 2.0, 2.5, 3.0]
        );
    }

    #[test]
    fn test_upscale_clamps_at_the_border() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 1, 2], DataType::Float32)).unwrap();
        input.write(&[0.0f32, 4.0]).unwrap();
        let params = ResizeBilinearParams {
            new_height: 1,
            new_width: 4,
            align_corners: false,
            android_nn: true,
        };
        let (_, out) = resize(&rt, PrecisionType::Fp32, input, &params);
        assert_eq!(out.read::<f32>().unwrap(), vec![0.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_texture_storage_selects_tflite_variant() {
        let rt = Runtime::host().unwrap();
        let input = rt
            .create_tensor(
                TensorDesc::new(&[1, 1, 1, 2], DataType::Float32).storage(StorageType::Texture),
            )
            .unwrap();
        input.write(&[0.0f32, 4.0]).unwrap();
        let params = ResizeBilinearParams {
            new_height: 1,
            new_width: 4,
            align_corners: false,
            android_nn: true,
        };
        let (op, out) = resize(&rt, PrecisionType::Fp32, input, &params);
        assert_eq!(op.kernel_names(), vec!["resize_bilinear_tflite_FP32".to_string()]);
        assert_eq!(out.read::<f32>().unwrap(), vec![0.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_tiled_32_to_512() {
        let rt = Runtime::host().unwrap();
        let input = rt
            .create_tensor(TensorDesc::new(&[1, 1, 32, 32], DataType::UInt8).quant(1.0, 0))
            .unwrap();
        input.write(&vec![7u8; 32 * 32]).unwrap();
        let params = ResizeBilinearParams {
            new_height: 512,
            new_width: 512,
            align_corners: true,
            android_nn: true,
        };
        let (op, out) = resize(&rt, PrecisionType::UInt8, input, &params);
        assert_eq!(op.kernel_names(), vec!["resize_bilinear_32_to_512_INT8".to_string()]);
        let values = out.read::<u8>().unwrap();
        assert_eq!(values.len(), 512 * 512);
        assert!(values.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_signed_variant() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 1, 1], DataType::Int8)).unwrap();
        input.write(&[-3i8]).unwrap();
        let params = ResizeBilinearParams {
            new_height: 2,
            new_width: 2,
            align_corners: false,
            android_nn: true,
        };
        let (op, out) = resize(&rt, PrecisionType::Int8, input, &params);
        assert_eq!(op.kernel_names(), vec!["SIGNEDresize_bilinear_INT8".to_string()]);
        assert_eq!(out.read::<i8>().unwrap(), vec![-3, -3, -3, -3]);
    }
}
