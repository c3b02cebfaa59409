use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Module, VarBuilder, VarMap,
};

use crate::config::NetworkKind;

/// Names of the per-head losses, in head order.
pub const HEAD_LOSS_NAMES: [&str; 4] = ["p_loss", "cos_loss", "sin_loss", "width_loss"];

/// The four output maps of a grasp network, each `(N, 1, H, W)`.
#[derive(Debug)]
pub struct GraspPrediction {
    pub position: Tensor,
    pub cos: Tensor,
    pub sin: Tensor,
    pub width: Tensor,
}

#[derive(Debug)]
pub struct GraspLoss {
    pub total: Tensor,
    pub heads: [Tensor; 4],
}

/// Records layer output shapes when enabled. Used for the architecture
/// summary.
#[derive(Debug, Default)]
pub struct Trace {
    enabled: bool,
    pub layers: Vec<TracedLayer>,
}

#[derive(Debug, Clone)]
pub struct TracedLayer {
    pub name: String,
    pub kind: &'static str,
    pub shape: Vec<usize>,
}

impl Trace {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            enabled: true,
            layers: Vec::new(),
        }
    }

    fn record(&mut self, name: &str, kind: &'static str, t: &Tensor) {
        if self.enabled {
            self.layers.push(TracedLayer {
                name: name.to_string(),
                kind,
                shape: t.dims().to_vec(),
            });
        }
    }
}

pub trait GraspNet {
    fn forward_traced(&self, x: &Tensor, trace: &mut Trace) -> Result<GraspPrediction>;

    fn forward(&self, x: &Tensor) -> Result<GraspPrediction> {
        self.forward_traced(x, &mut Trace::disabled())
    }
}

pub fn build_network(
    kind: NetworkKind,
    input_channels: usize,
    vb: VarBuilder,
) -> Result<Box<dyn GraspNet>> {
    Ok(match kind {
        NetworkKind::Ggcnn => Box::new(GgCnn::new(input_channels, vb)?),
        NetworkKind::Ggcnn2 => Box::new(GgCnn2::new(input_channels, vb)?),
    })
}

/// Sum of the mean squared errors of the four heads.
pub fn compute_loss(
    pred: &GraspPrediction,
    position: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    width: &Tensor,
) -> Result<GraspLoss> {
    let p_loss = candle_nn::loss::mse(&pred.position, position)?;
    let cos_loss = candle_nn::loss::mse(&pred.cos, cos)?;
    let sin_loss = candle_nn::loss::mse(&pred.sin, sin)?;
    let width_loss = candle_nn::loss::mse(&pred.width, width)?;
    let total = (((&p_loss + &cos_loss)? + &sin_loss)? + &width_loss)?;
    Ok(GraspLoss {
        total,
        heads: [p_loss, cos_loss, sin_loss, width_loss],
    })
}

struct Heads {
    pos: Conv2d,
    cos: Conv2d,
    sin: Conv2d,
    width: Conv2d,
}

impl Heads {
    fn new(in_channels: usize, kernel: usize, vb: &VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig::default();
        Ok(Self {
            pos: conv2d(in_channels, 1, kernel, cfg, vb.pp("pos_output"))?,
            cos: conv2d(in_channels, 1, kernel, cfg, vb.pp("cos_output"))?,
            sin: conv2d(in_channels, 1, kernel, cfg, vb.pp("sin_output"))?,
            width: conv2d(in_channels, 1, kernel, cfg, vb.pp("width_output"))?,
        })
    }

    fn forward(&self, x: &Tensor, trace: &mut Trace) -> Result<GraspPrediction> {
        let position = self.pos.forward(x)?;
        trace.record("pos_output", "Conv2d", &position);
        let cos = self.cos.forward(x)?;
        trace.record("cos_output", "Conv2d", &cos);
        let sin = self.sin.forward(x)?;
        trace.record("sin_output", "Conv2d", &sin);
        let width = self.width.forward(x)?;
        trace.record("width_output", "Conv2d", &width);
        Ok(GraspPrediction {
            position,
            cos,
            sin,
            width,
        })
    }
}

/// Generative Grasping CNN: three strided convolutions, three transposed
/// convolutions back to input resolution, four 2x2 output heads.
pub struct GgCnn {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    convt1: ConvTranspose2d,
    convt2: ConvTranspose2d,
    convt3: ConvTranspose2d,
    heads: Heads,
}

impl GgCnn {
    const FILTERS: [usize; 6] = [32, 16, 8, 8, 16, 32];
    const KERNELS: [usize; 6] = [9, 5, 3, 3, 5, 9];
    const STRIDES: [usize; 6] = [3, 2, 2, 2, 2, 3];

    pub fn new(input_channels: usize, vb: VarBuilder) -> Result<Self> {
        let (f, k, s) = (Self::FILTERS, Self::KERNELS, Self::STRIDES);
        let conv = |i: usize, in_c: usize, name: &str| {
            let cfg = Conv2dConfig {
                padding: k[i] / 2 - usize::from(i == 0),
                stride: s[i],
                ..Default::default()
            };
            conv2d(in_c, f[i], k[i], cfg, vb.pp(name))
        };
        let convt = |i: usize, in_c: usize, name: &str| {
            let cfg = ConvTranspose2dConfig {
                padding: k[i] / 2 - usize::from(i == 5),
                output_padding: 1,
                stride: s[i],
                dilation: 1,
            };
            conv_transpose2d(in_c, f[i], k[i], cfg, vb.pp(name))
        };

        Ok(Self {
            conv1: conv(0, input_channels, "conv1")?,
            conv2: conv(1, f[0], "conv2")?,
            conv3: conv(2, f[1], "conv3")?,
            convt1: convt(3, f[2], "convt1")?,
            convt2: convt(4, f[3], "convt2")?,
            convt3: convt(5, f[4], "convt3")?,
            heads: Heads::new(f[5], 2, &vb)?,
        })
    }
}

impl GraspNet for GgCnn {
    fn forward_traced(&self, x: &Tensor, trace: &mut Trace) -> Result<GraspPrediction> {
        let x = self.conv1.forward(x)?.relu()?;
        trace.record("conv1", "Conv2d", &x);
        let x = self.conv2.forward(&x)?.relu()?;
        trace.record("conv2", "Conv2d", &x);
        let x = self.conv3.forward(&x)?.relu()?;
        trace.record("conv3", "Conv2d", &x);
        let x = self.convt1.forward(&x)?.relu()?;
        trace.record("convt1", "ConvTranspose2d", &x);
        let x = self.convt2.forward(&x)?.relu()?;
        trace.record("convt2", "ConvTranspose2d", &x);
        let x = self.convt3.forward(&x)?.relu()?;
        trace.record("convt3", "ConvTranspose2d", &x);
        self.heads.forward(&x, trace)
    }
}

/// GG-CNN2: plain convolutions with pooling, dilated convolutions for
/// context, then upsampling back to input resolution.
pub struct GgCnn2 {
    features: Vec<(String, Conv2d)>,
    heads: Heads,
}

impl GgCnn2 {
    const FILTERS: [usize; 4] = [16, 16, 32, 16];
    const L3_KERNEL: usize = 5;
    const DILATIONS: [usize; 2] = [2, 4];

    pub fn new(input_channels: usize, vb: VarBuilder) -> Result<Self> {
        let f = Self::FILTERS;
        let d = Self::DILATIONS;
        let k3 = Self::L3_KERNEL;
        // (name, in, out, kernel, padding, dilation)
        let layers = [
            ("conv1", input_channels, f[0], 11, 5, 1),
            ("conv2", f[0], f[0], 5, 2, 1),
            ("conv3", f[0], f[1], 5, 2, 1),
            ("conv4", f[1], f[1], 5, 2, 1),
            ("dilated1", f[1], f[2], k3, k3 / 2 * d[0], d[0]),
            ("dilated2", f[2], f[2], k3, k3 / 2 * d[1], d[1]),
            ("up_conv1", f[2], f[3], 3, 1, 1),
            ("up_conv2", f[3], f[3], 3, 1, 1),
        ];

        let mut features = Vec::with_capacity(layers.len());
        for (name, in_c, out_c, kernel, padding, dilation) in layers {
            let cfg = Conv2dConfig {
                padding,
                dilation,
                ..Default::default()
            };
            features.push((name.to_string(), conv2d(in_c, out_c, kernel, cfg, vb.pp(name))?));
        }

        Ok(Self {
            features,
            heads: Heads::new(f[3], 1, &vb)?,
        })
    }
}

impl GraspNet for GgCnn2 {
    fn forward_traced(&self, x: &Tensor, trace: &mut Trace) -> Result<GraspPrediction> {
        let mut x = x.clone();
        for (i, (name, conv)) in self.features.iter().enumerate() {
            // Upsample ahead of each output-side convolution.
            if i >= 6 {
                let (_, _, h, w) = x.dims4()?;
                x = x.upsample_nearest2d(h * 2, w * 2)?;
                trace.record(&format!("upsample{}", i - 5), "Upsample", &x);
            }
            x = conv.forward(&x)?.relu()?;
            trace.record(name, "Conv2d", &x);
            // Pool after each pair of leading convolutions.
            if i == 1 || i == 3 {
                x = x.max_pool2d(2)?;
                trace.record(&format!("pool{}", i / 2 + 1), "MaxPool2d", &x);
            }
        }
        self.heads.forward(&x, trace)
    }
}

/// Per-layer output shapes and parameter counts for a `(1, C, size, size)`
/// input, laid out like a torch model summary.
pub fn architecture_summary(
    net: &dyn GraspNet,
    varmap: &VarMap,
    input_channels: usize,
    size: usize,
    device: &Device,
) -> anyhow::Result<String> {
    let input = Tensor::zeros((1, input_channels, size, size), DType::F32, device)?;
    let mut trace = Trace::enabled();
    net.forward_traced(&input, &mut trace)?;

    let params: Vec<(String, usize)> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Parameter map lock poisoned"))?;
        data.iter()
            .map(|(name, var)| (name.clone(), var.elem_count()))
            .collect()
    };

    let rule = "-".repeat(72);
    let double_rule = "=".repeat(72);
    let mut out = String::new();
    out.push_str(&format!("{rule}\n"));
    out.push_str(&format!(
        "{:>30}  {:>24}  {:>14}\n",
        "Layer (type)", "Output Shape", "Param #"
    ));
    out.push_str(&format!("{double_rule}\n"));

    let mut total = 0usize;
    for layer in &trace.layers {
        let prefix = format!("{}.", layer.name);
        let count: usize = params
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(_, n)| n)
            .sum();
        total += count;
        let shape: Vec<String> = std::iter::once("-1".to_string())
            .chain(layer.shape.iter().skip(1).map(usize::to_string))
            .collect();
        out.push_str(&format!(
            "{:>30}  {:>24}  {:>14}\n",
            format!("{} ({})", layer.name, layer.kind),
            format!("[{}]", shape.join(", ")),
            group_thousands(count)
        ));
    }

    out.push_str(&format!("{double_rule}\n"));
    out.push_str(&format!("Total params: {}\n", group_thousands(total)));
    out.push_str(&format!("Trainable params: {}\n", group_thousands(total)));
    out.push_str("Non-trainable params: 0\n");
    out.push_str(&format!(
        "Input size: ({input_channels}, {size}, {size})\n"
    ));
    out.push_str(&format!("{rule}\n"));
    Ok(out)
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(kind: NetworkKind, channels: usize) -> (Box<dyn GraspNet>, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = build_network(kind, channels, vb).unwrap();
        (net, varmap)
    }

    #[test]
    fn ggcnn_outputs_match_input_resolution() {
        let (net, _) = build(NetworkKind::Ggcnn, 1);
        let x = Tensor::zeros((2, 1, 96, 96), DType::F32, &Device::Cpu).unwrap();
        let pred = net.forward(&x).unwrap();
        for t in [&pred.position, &pred.cos, &pred.sin, &pred.width] {
            assert_eq!(t.dims(), &[2, 1, 96, 96]);
        }
    }

    #[test]
    fn ggcnn2_outputs_match_input_resolution() {
        let (net, _) = build(NetworkKind::Ggcnn2, 4);
        let x = Tensor::zeros((1, 4, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let pred = net.forward(&x).unwrap();
        assert_eq!(pred.position.dims(), &[1, 1, 64, 64]);
        assert_eq!(pred.width.dims(), &[1, 1, 64, 64]);
    }

    #[test]
    fn summary_counts_ggcnn_parameters() {
        let (net, varmap) = build(NetworkKind::Ggcnn, 1);
        let summary = architecture_summary(net.as_ref(), &varmap, 1, 300, &Device::Cpu).unwrap();
        assert!(summary.contains("Total params: 62,420"), "{summary}");
        assert!(summary.contains("[-1, 32, 100, 100]"));
        assert!(summary.contains("[-1, 1, 300, 300]"));
    }

    #[test]
    fn loss_is_zero_for_perfect_prediction() {
        let t = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let pred = GraspPrediction {
            position: t.clone(),
            cos: t.clone(),
            sin: t.clone(),
            width: t.clone(),
        };
        let loss = compute_loss(&pred, &t, &t, &t, &t).unwrap();
        assert_eq!(loss.total.to_scalar::<f32>().unwrap(), 0.0);

        let zeros = t.zeros_like().unwrap();
        let loss = compute_loss(&pred, &zeros, &t, &t, &t).unwrap();
        assert!((loss.total.to_scalar::<f32>().unwrap() - 1.0).abs() < 1e-6);
        assert!((loss.heads[0].to_scalar::<f32>().unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(62420), "62,420");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
