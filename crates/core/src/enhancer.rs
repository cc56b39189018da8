//! Per-request super-resolution enhancer: `ort::Session` lifecycle, tiled
//! inference, and deterministic release.
//!
//! One `Enhancer` is constructed per request and owns its session (weights +
//! accelerator buffers) exclusively. Nothing here is shared across requests;
//! `release()` is the single reclamation point and is backed up by `Drop`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, warn};

use crate::accel::Precision;
use crate::codec::RawImage;
use crate::error::EnhanceError;
use crate::models::ScaleFactor;

/// Model requires spatial dimensions to be multiples of this.
const PAD_ALIGN: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct EnhancerConfig {
    pub scale: ScaleFactor,
    /// Tile edge length in pixels; 0 runs the whole image as one batch.
    pub tile_size: u32,
    /// Context padding around each tile, discarded after stitching.
    pub tile_pad: u32,
    /// Reflection pre-padding applied to the whole image.
    pub pre_pad: u32,
    pub precision: Precision,
}

#[derive(Debug)]
pub struct Enhancer {
    session: Option<Session>,
    config: EnhancerConfig,
    input_name: String,
    output_name: String,
    is_fp16_model: bool,
    released: bool,
}

impl Enhancer {
    /// Load the weight file into a fresh session configured for this
    /// request. Missing, corrupt, or architecture-mismatched weights fail
    /// with [`EnhanceError::ModelLoad`].
    pub fn construct(model_path: &Path, config: EnhancerConfig) -> Result<Self, EnhanceError> {
        let session = build_session(model_path, config.precision)
            .map_err(|err| EnhanceError::ModelLoad(format!("{err:#}")))?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| EnhanceError::ModelLoad("model declares no inputs".to_string()))?;
        let input_name = input.name().to_string();
        let is_fp16_model = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .ok_or_else(|| EnhanceError::ModelLoad("model declares no outputs".to_string()))?
            .name()
            .to_string();

        debug!(
            model = %model_path.display(),
            scale = %config.scale,
            tile_size = config.tile_size,
            %input_name,
            %output_name,
            is_fp16_model,
            "Enhancer session ready"
        );

        Ok(Self {
            session: Some(session),
            config,
            input_name,
            output_name,
            is_fp16_model,
            released: false,
        })
    }

    pub fn config(&self) -> &EnhancerConfig {
        &self.config
    }

    /// Run forward inference. Output dimensions are exactly input
    /// dimensions times the configured scale in both axes.
    pub fn infer(&mut self, image: &RawImage) -> Result<RawImage, EnhanceError> {
        self.infer_inner(image)
            .map_err(|err| EnhanceError::Inference(format!("{err:#}")))
    }

    fn infer_inner(&mut self, image: &RawImage) -> Result<RawImage> {
        if self.session.is_none() {
            bail!("enhancer already released");
        }

        let scale = self.config.scale.factor() as usize;
        let tile_size = self.config.tile_size as usize;
        let tile_pad = self.config.tile_pad as usize;
        let pre_pad = self.config.pre_pad as usize;

        let h = image.height as usize;
        let w = image.width as usize;

        let mut input = rgb_to_nchw(image)?;
        if pre_pad > 0 {
            input = reflect_pad_nchw(&input, pre_pad, pre_pad);
        }

        let output = if tile_size > 0 {
            self.run_tiled(&input, h, w, tile_size, tile_pad, scale)?
        } else {
            self.run_whole(&input, h, w, scale)?
        };

        // Cropping to the exact target also discards the pre_pad margin.
        let out_h = h * scale;
        let out_w = w * scale;
        let data = nchw_to_rgb(&output, out_h, out_w)?;

        Ok(RawImage {
            data,
            width: out_w as u32,
            height: out_h as u32,
        })
    }

    fn run_whole(
        &mut self,
        input: &Array4<f32>,
        orig_h: usize,
        orig_w: usize,
        scale: usize,
    ) -> Result<Array4<f32>> {
        let (in_h, in_w) = (input.shape()[2], input.shape()[3]);
        let aligned = reflect_pad_nchw(input, pad_amount(in_h), pad_amount(in_w));

        let output = self.run_session(&aligned)?;

        let out_h = orig_h * scale;
        let out_w = orig_w * scale;
        crop_nchw(&output, out_h, out_w)
    }

    /// Overlapping-tile inference: each core tile is expanded by `tile_pad`
    /// pixels of context, run independently, and only the core region of
    /// its output is stitched back. Bounds peak memory at the cost of
    /// latency.
    fn run_tiled(
        &mut self,
        input: &Array4<f32>,
        orig_h: usize,
        orig_w: usize,
        tile_size: usize,
        tile_pad: usize,
        scale: usize,
    ) -> Result<Array4<f32>> {
        let in_h = input.shape()[2];
        let in_w = input.shape()[3];

        let out_h = orig_h * scale;
        let out_w = orig_w * scale;
        let mut output = Array4::<f32>::zeros((1, 3, out_h, out_w));

        let tiles = tile_grid(orig_h.min(in_h), orig_w.min(in_w), tile_size, tile_pad);
        debug!(
            tiles = tiles.len(),
            tile_size, tile_pad, "Starting tiled inference"
        );

        for tile in &tiles {
            let tile_h = tile.py1 - tile.py0;
            let tile_w = tile.px1 - tile.px0;

            let tile_input = input
                .slice(s![.., .., tile.py0..tile.py1, tile.px0..tile.px1])
                .to_owned();
            let aligned = reflect_pad_nchw(&tile_input, pad_amount(tile_h), pad_amount(tile_w));

            let tile_output = self.run_session(&aligned)?;

            // Offsets of the core region inside this tile's output.
            let crop_y0 = (tile.y0 - tile.py0) * scale;
            let crop_x0 = (tile.x0 - tile.px0) * scale;
            let core_h = (tile.y1 - tile.y0) * scale;
            let core_w = (tile.x1 - tile.x0) * scale;

            let out_y0 = tile.y0 * scale;
            let out_x0 = tile.x0 * scale;

            output
                .slice_mut(s![
                    ..,
                    ..,
                    out_y0..out_y0 + core_h,
                    out_x0..out_x0 + core_w
                ])
                .assign(&tile_output.slice(s![
                    ..,
                    ..,
                    crop_y0..crop_y0 + core_h,
                    crop_x0..crop_x0 + core_w
                ]));
        }

        Ok(output)
    }

    fn run_session(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let use_f16 =
            self.is_fp16_model && matches!(self.config.precision, Precision::Reduced);
        let input_name = self.input_name.clone();
        let output_name = self.output_name.clone();
        let session = self
            .session
            .as_mut()
            .context("enhancer already released")?;

        let output = if use_f16 {
            run_f16(session, input, &input_name, &output_name)?
        } else {
            let tensor = Tensor::from_array(input.clone())?;
            let outputs = session.run(ort::inputs![input_name.as_str() => &tensor])?;
            let view = outputs[output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        };

        output
            .into_dimensionality::<ndarray::Ix4>()
            .context("model output is not a 4-D tensor")
    }

    /// Drop the session and everything it holds. Idempotent, never panics,
    /// never propagates: cleanup must not mask the primary outcome of the
    /// request.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(session) = self.session.take() {
            drop(session);
            debug!(scale = %self.config.scale, "Enhancer released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Test seam: an enhancer with no session, for exercising the release
    /// contract without loading weights.
    #[cfg(test)]
    pub(crate) fn detached(config: EnhancerConfig) -> Self {
        Self {
            session: None,
            config,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            is_fp16_model: false,
            released: false,
        }
    }
}

impl Drop for Enhancer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build an `ort::Session` for the weight file. Reduced precision implies an
/// accelerator: register the CUDA EP (ORT falls back to CPU when it is
/// unavailable at runtime). Full precision stays on the default CPU EP.
fn build_session(model_path: &Path, precision: Precision) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match precision {
        Precision::Reduced => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available — inference will fall back to CPU");
            }

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .with_context(|| {
                    format!("failed to load ONNX model: {}", model_path.display())
                })?
        }
        Precision::Full => builder.commit_from_file(model_path).with_context(|| {
            format!("failed to load ONNX model: {}", model_path.display())
        })?,
    };

    Ok(session)
}

fn run_f16(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ndarray::ArrayD<f32>> {
    let f32_slice = input
        .as_slice()
        .context("input must be contiguous for f16 conversion")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let shape: Vec<usize> = input.shape().to_vec();
    let fp16_array = ndarray::ArrayD::from_shape_vec(shape, fp16_data)?;
    let tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &tensor])?;
    let view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned;
    let fp16_slice = if let Some(slice) = view.as_slice() {
        slice
    } else {
        fp16_owned = view.as_standard_layout().into_owned();
        fp16_owned.as_slice().context("non-contiguous f16 output")?
    };
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ndarray::ArrayD::from_shape_vec(
        view.shape().to_vec(),
        f32_data,
    )?)
}

/// One tile of the input plane: `(x0,y0)..(x1,y1)` is the core region
/// (cores exactly partition the image), `(px0,py0)..(px1,py1)` the padded
/// region actually run through the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tile {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
    pub px0: usize,
    pub py0: usize,
    pub px1: usize,
    pub py1: usize,
}

pub(crate) fn tile_grid(h: usize, w: usize, tile_size: usize, tile_pad: usize) -> Vec<Tile> {
    let mut tiles = Vec::new();
    let mut y0 = 0usize;
    while y0 < h {
        let y1 = (y0 + tile_size).min(h);
        let mut x0 = 0usize;
        while x0 < w {
            let x1 = (x0 + tile_size).min(w);
            tiles.push(Tile {
                x0,
                y0,
                x1,
                y1,
                px0: x0.saturating_sub(tile_pad),
                py0: y0.saturating_sub(tile_pad),
                px1: (x1 + tile_pad).min(w),
                py1: (y1 + tile_pad).min(h),
            });
            x0 = x1;
        }
        y0 = y1;
    }
    tiles
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Convert interleaved HWC RGB8 to NCHW `[1,3,H,W]` float32 in the 0-255
/// range the ESRGAN family expects.
fn rgb_to_nchw(image: &RawImage) -> Result<Array4<f32>> {
    let h = image.height as usize;
    let w = image.width as usize;
    let expected = h * w * 3;
    if image.data.len() != expected {
        bail!(
            "pixel buffer length mismatch: expected {expected} ({h}x{w}x3), got {}",
            image.data.len()
        );
    }

    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    let slice = nchw.as_slice_mut().context("nchw must be C-contiguous")?;
    let hw = h * w;

    for i in 0..hw {
        let src = i * 3;
        slice[i] = image.data[src] as f32;
        slice[hw + i] = image.data[src + 1] as f32;
        slice[2 * hw + i] = image.data[src + 2] as f32;
    }

    Ok(nchw)
}

/// Convert NCHW `[1,3,H,W]` float32 back to interleaved RGB8, clamping to
/// 0-255. The source array may be larger than `out_h`x`out_w`; the excess
/// (alignment and pre-padding) is ignored.
fn nchw_to_rgb(arr: &Array4<f32>, out_h: usize, out_w: usize) -> Result<Vec<u8>> {
    let cropped = crop_nchw(arr, out_h, out_w)?;
    let owned_contig;
    let slice = if let Some(slice) = cropped.as_slice() {
        slice
    } else {
        owned_contig = cropped.as_standard_layout().into_owned();
        owned_contig.as_slice().context("non-contiguous output")?
    };
    let hw = out_h * out_w;

    let mut rgb = vec![0u8; hw * 3];
    for i in 0..hw {
        rgb[i * 3] = slice[i].clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 1] = slice[hw + i].clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 2] = slice[2 * hw + i].clamp(0.0, 255.0) as u8;
    }
    Ok(rgb)
}

fn crop_nchw(arr: &Array4<f32>, out_h: usize, out_w: usize) -> Result<Array4<f32>> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    if h < out_h || w < out_w {
        bail!("model output {h}x{w} is smaller than expected {out_h}x{out_w}");
    }
    if h == out_h && w == out_w {
        return Ok(arr.clone());
    }
    Ok(arr.slice(s![.., .., ..out_h, ..out_w]).to_owned())
}

/// Reflection-pad an NCHW array on the bottom and right edges.
fn reflect_pad_nchw(arr: &Array4<f32>, pad_h: usize, pad_w: usize) -> Array4<f32> {
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let h = arr.shape()[2];
    let w = arr.shape()[3];
    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));

    padded
        .slice_mut(s![.., .., ..h, ..w])
        .assign(&arr.slice(s![.., .., ..h, ..w]));

    for y in 0..pad_h {
        let src_y = reflect_index(h, y);
        for c in 0..3 {
            for x in 0..w {
                padded[[0, c, h + y, x]] = arr[[0, c, src_y, x]];
            }
        }
    }

    for x in 0..pad_w {
        let src_x = reflect_index(w, x);
        for c in 0..3 {
            for y in 0..new_h {
                let src_y = if y < h { y } else { reflect_index(h, y - h) };
                padded[[0, c, y, w + x]] = arr[[0, c, src_y, src_x]];
            }
        }
    }

    padded
}

/// Mirror index for padding step `step` past the edge of a dimension of
/// length `len`. Clamped so tiny inputs never index out of bounds.
fn reflect_index(len: usize, step: usize) -> usize {
    len.checked_sub(1 + step).unwrap_or(0)
}
