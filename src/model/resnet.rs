//! ResNet feature extractors with a fully differentiable stem
//!
//! Variable names follow the torchvision layout (`conv1`, `bn1`,
//! `layer1.0.conv1`, `layer1.0.downsample.0`, ...), so safetensors
//! checkpoints exported from torchvision ResNets load directly. Batch norm
//! always runs on its running statistics.

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Func, VarBuilder};

const BN_EPS: f64 = 1e-5;

/// Bottleneck blocks widen their output by this factor
const EXPANSION: usize = 4;

fn conv2d(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let config = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    conv2d_no_bias(c_in, c_out, kernel, config, vb)
}

/// Convolution followed by eval-mode batch norm
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        padding: usize,
        stride: usize,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv: conv2d(c_in, c_out, kernel, padding, stride, conv_vb)?,
            bn: batch_norm(c_out, BN_EPS, bn_vb)?,
        })
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.bn.forward_t(&xs.apply(&self.conv)?, false)
    }
}

/// Projection shortcut, present when the block changes shape
fn shortcut(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Option<ConvBn>> {
    if stride == 1 && c_in == c_out {
        return Ok(None);
    }
    ConvBn::new(c_in, c_out, 1, 0, stride, vb.pp(0), vb.pp(1)).map(Some)
}

fn residual(xs: &Tensor, ys: Tensor, downsample: Option<&ConvBn>) -> Result<Tensor> {
    let identity = match downsample {
        Some(downsample) => xs.apply(downsample)?,
        None => xs.clone(),
    };
    (identity + ys)?.relu()
}

fn basic_block(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Func<'static>> {
    let first = ConvBn::new(c_in, c_out, 3, 1, stride, vb.pp("conv1"), vb.pp("bn1"))?;
    let second = ConvBn::new(c_out, c_out, 3, 1, 1, vb.pp("conv2"), vb.pp("bn2"))?;
    let downsample = shortcut(c_in, c_out, stride, vb.pp("downsample"))?;

    Ok(Func::new(move |xs| {
        let ys = xs.apply(&first)?.relu()?.apply(&second)?;
        residual(xs, ys, downsample.as_ref())
    }))
}

fn bottleneck_block(c_in: usize, c_mid: usize, stride: usize, vb: VarBuilder) -> Result<Func<'static>> {
    let c_out = c_mid * EXPANSION;
    let reduce = ConvBn::new(c_in, c_mid, 1, 0, 1, vb.pp("conv1"), vb.pp("bn1"))?;
    let spatial = ConvBn::new(c_mid, c_mid, 3, 1, stride, vb.pp("conv2"), vb.pp("bn2"))?;
    let expand = ConvBn::new(c_mid, c_out, 1, 0, 1, vb.pp("conv3"), vb.pp("bn3"))?;
    let downsample = shortcut(c_in, c_out, stride, vb.pp("downsample"))?;

    Ok(Func::new(move |xs| {
        let ys = xs
            .apply(&reduce)?
            .relu()?
            .apply(&spatial)?
            .relu()?
            .apply(&expand)?;
        residual(xs, ys, downsample.as_ref())
    }))
}

/// Block layout of one residual stage
#[derive(Debug, Clone, Copy)]
enum Block {
    Basic,
    Bottleneck,
}

impl Block {
    fn output_channels(self, width: usize) -> usize {
        match self {
            Block::Basic => width,
            Block::Bottleneck => width * EXPANSION,
        }
    }
}

fn stage(
    block: Block,
    c_in: usize,
    width: usize,
    stride: usize,
    count: usize,
    vb: VarBuilder,
) -> Result<Func<'static>> {
    let mut blocks = Vec::with_capacity(count);
    for index in 0..count {
        let (l_in, l_stride) = if index == 0 {
            (c_in, stride)
        } else {
            (block.output_channels(width), 1)
        };
        blocks.push(match block {
            Block::Basic => basic_block(l_in, width, l_stride, vb.pp(index))?,
            Block::Bottleneck => bottleneck_block(l_in, width, l_stride, vb.pp(index))?,
        });
    }

    Ok(Func::new(move |xs| {
        let mut xs = xs.clone();
        for block in blocks.iter() {
            xs = xs.apply(block)?;
        }
        Ok(xs)
    }))
}

/// Every `stride`-th position along `dim`, starting at `offset`, for `count` positions
fn strided(xs: &Tensor, dim: usize, offset: usize, stride: usize, count: usize) -> Result<Tensor> {
    let indices: Vec<u32> = (0..count).map(|i| (offset + i * stride) as u32).collect();
    let indices = Tensor::new(indices.as_slice(), xs.device())?;
    xs.contiguous()?.index_select(&indices, dim)
}

/// 3x3 max pooling with stride 2 and padding 1 over `[N, C, H, W]`.
///
/// Built from index selection and element-wise maxima so gradients flow
/// through it. Edge replication stands in for negative-infinity padding:
/// every padded cell repeats a value already inside its window.
pub fn max_pool_3x3_s2(xs: &Tensor) -> Result<Tensor> {
    let padded = xs.pad_with_same(D::Minus1, 1, 1)?.pad_with_same(D::Minus2, 1, 1)?;
    let (_, _, h, w) = padded.dims4()?;
    let out_h = (h - 3) / 2 + 1;
    let out_w = (w - 3) / 2 + 1;

    let mut pooled: Option<Tensor> = None;
    for dy in 0..3 {
        let rows = strided(&padded, 2, dy, 2, out_h)?;
        for dx in 0..3 {
            let window = strided(&rows, 3, dx, 2, out_w)?;
            pooled = Some(match pooled {
                Some(acc) => acc.maximum(&window)?,
                None => window,
            });
        }
    }
    pooled.ok_or_else(|| candle_core::Error::Msg("empty pooling window".to_string()))
}

fn resnet(block: Block, counts: [usize; 4], vb: VarBuilder) -> Result<Func<'static>> {
    let stem = ConvBn::new(3, 64, 7, 3, 2, vb.pp("conv1"), vb.pp("bn1"))?;

    let widths = [64, 128, 256, 512];
    let mut stages = Vec::with_capacity(4);
    let mut c_in = 64;
    for (index, (&width, &count)) in widths.iter().zip(counts.iter()).enumerate() {
        let stride = if index == 0 { 1 } else { 2 };
        stages.push(stage(block, c_in, width, stride, count, vb.pp(format!("layer{}", index + 1)))?);
        c_in = block.output_channels(width);
    }

    Ok(Func::new(move |xs| {
        let mut xs = max_pool_3x3_s2(&xs.apply(&stem)?.relu()?)?;
        for stage in stages.iter() {
            xs = xs.apply(stage)?;
        }
        // global average pool to [N, C]
        xs.mean(D::Minus1)?.mean(D::Minus1)
    }))
}

/// ResNet-18 trunk producing 512 features per image
pub fn resnet18(vb: VarBuilder) -> Result<Func<'static>> {
    resnet(Block::Basic, [2, 2, 2, 2], vb)
}

/// ResNet-34 trunk producing 512 features per image
pub fn resnet34(vb: VarBuilder) -> Result<Func<'static>> {
    resnet(Block::Basic, [3, 4, 6, 3], vb)
}

/// ResNet-50 trunk producing 2048 features per image
pub fn resnet50(vb: VarBuilder) -> Result<Func<'static>> {
    resnet(Block::Bottleneck, [3, 4, 6, 3], vb)
}
