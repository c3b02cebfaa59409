use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult};

/// A single-channel float image stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> anyhow::Result<Self> {
        if data.len() != height * width {
            anyhow::bail!(
                "Plane data has {} values, expected {}x{}",
                data.len(),
                height,
                width
            );
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0.0; height * width],
        }
    }

    pub fn at(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.width + c]
    }

    /// Crops to `[top, bottom) x [left, right)`, clamped to the image.
    pub fn crop(&self, top_left: (usize, usize), bottom_right: (usize, usize)) -> Self {
        let bottom = bottom_right.0.min(self.height);
        let right = bottom_right.1.min(self.width);
        let top = top_left.0.min(bottom);
        let left = top_left.1.min(right);
        let mut data = Vec::with_capacity((bottom - top) * (right - left));
        for r in top..bottom {
            data.extend_from_slice(&self.data[r * self.width + left..r * self.width + right]);
        }
        Self {
            height: bottom - top,
            width: right - left,
            data,
        }
    }

    pub fn resize(&self, height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: resize_bilinear_channel(&self.data, self.height, self.width, height, width),
        }
    }

    /// Rotates the content by `angle` radians about `center` (`[row, col]`),
    /// matching `GraspRectangle::rotate`. Borders are reflected.
    pub fn rotate(&self, angle: f64, center: [f64; 2]) -> Self {
        if angle == 0.0 {
            return self.clone();
        }
        let (s, c) = angle.sin_cos();
        let mut data = vec![0f32; self.data.len()];
        for r in 0..self.height {
            for col in 0..self.width {
                let dy = r as f64 - center[0];
                let dx = col as f64 - center[1];
                let src_r = c * dy - s * dx + center[0];
                let src_c = s * dy + c * dx + center[1];
                data[r * self.width + col] = self.sample_symmetric(src_r, src_c);
            }
        }
        Self {
            height: self.height,
            width: self.width,
            data,
        }
    }

    /// Crops the central `factor` of the image and resizes back to the
    /// original shape.
    pub fn zoom(&self, factor: f64) -> Self {
        if (factor - 1.0).abs() < f64::EPSILON {
            return self.clone();
        }
        let sr = ((self.height as f64 * (1.0 - factor)) as usize) / 2;
        let sc = ((self.width as f64 * (1.0 - factor)) as usize) / 2;
        self.crop((sr, sc), (self.height - sr, self.width - sc))
            .resize(self.height, self.width)
    }

    /// Depth normalisation: subtract the mean and clip to `[-1, 1]`.
    /// Non-finite pixels become zero first.
    pub fn normalise_depth(&mut self) {
        self.data.iter_mut().for_each(|v| {
            if !v.is_finite() {
                *v = 0.0;
            }
        });
        let mean = mean(&self.data);
        self.data
            .iter_mut()
            .for_each(|v| *v = (*v - mean).clamp(-1.0, 1.0));
    }

    pub fn gaussian_filter(&self, sigma: f32) -> Self {
        Self {
            height: self.height,
            width: self.width,
            data: gaussian_filter(&self.data, self.height, self.width, sigma),
        }
    }

    fn sample_symmetric(&self, r: f64, c: f64) -> f32 {
        let r = reflect(r, self.height);
        let c = reflect(c, self.width);
        let r0 = r.floor() as usize;
        let c0 = c.floor() as usize;
        let r1 = (r0 + 1).min(self.height - 1);
        let c1 = (c0 + 1).min(self.width - 1);
        let wr = (r - r0 as f64) as f32;
        let wc = (c - c0 as f64) as f32;
        let top = self.at(r0, c0) * (1.0 - wc) + self.at(r0, c1) * wc;
        let bottom = self.at(r1, c0) * (1.0 - wc) + self.at(r1, c1) * wc;
        top * (1.0 - wr) + bottom * wr
    }
}

/// Three colour planes in RGB order.
#[derive(Clone, Debug)]
pub struct ColourImage {
    pub channels: [Plane; 3],
}

impl ColourImage {
    pub fn height(&self) -> usize {
        self.channels[0].height
    }

    pub fn width(&self) -> usize {
        self.channels[0].width
    }

    pub fn map(&self, f: impl Fn(&Plane) -> Plane) -> Self {
        Self {
            channels: [
                f(&self.channels[0]),
                f(&self.channels[1]),
                f(&self.channels[2]),
            ],
        }
    }

    /// Scales to `[0, 1]` and subtracts the mean over all channels.
    pub fn normalise(&mut self) {
        let total: f32 = self
            .channels
            .iter()
            .map(|p| p.data.iter().map(|v| v / 255.0).sum::<f32>())
            .sum();
        let count: usize = self.channels.iter().map(|p| p.data.len()).sum();
        let mean = if count == 0 { 0.0 } else { total / count as f32 };
        for plane in &mut self.channels {
            plane.data.iter_mut().for_each(|v| *v = *v / 255.0 - mean);
        }
    }

    /// CHW layout.
    pub fn to_chw(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(3 * self.height() * self.width());
        for plane in &self.channels {
            out.extend_from_slice(&plane.data);
        }
        out
    }
}

/// Loads a depth image. `.npy` files hold a 2-D `f32` array and TIFFs are
/// decoded with `tiff`, which handles the float32 maps both datasets ship.
/// Anything else goes through `image` as a single float channel.
pub fn load_depth(path: &Path) -> anyhow::Result<Plane> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "npy" => {
            let array: Array2<f32> = ndarray_npy::read_npy(path)
                .with_context(|| format!("Failed to read depth array: {}", path.display()))?;
            let (h, w) = array.dim();
            Plane::new(h, w, array.iter().copied().collect())
        }
        "tif" | "tiff" => load_depth_tiff(path),
        _ => {
            let depth = image::open(path)
                .with_context(|| format!("Failed to open depth image: {}", path.display()))?
                .to_luma32f();
            let (w, h) = depth.dimensions();
            Plane::new(h as usize, w as usize, depth.into_raw())
        }
    }
}

/// Decodes the first page of a TIFF, keeping the first sample of each
/// pixel as raw depth.
fn load_depth_tiff(path: &Path) -> anyhow::Result<Plane> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open depth image: {}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .with_context(|| format!("Failed to read TIFF header: {}", path.display()))?;
    let (w, h) = decoder
        .dimensions()
        .with_context(|| format!("Failed to read TIFF dimensions: {}", path.display()))?;
    let (w, h) = (w as usize, h as usize);
    let image = decoder
        .read_image()
        .with_context(|| format!("Failed to decode depth image: {}", path.display()))?;

    let data = match image {
        DecodingResult::F32(v) => first_sample(&v, h * w, |x| x),
        DecodingResult::F64(v) => first_sample(&v, h * w, |x| x as f32),
        DecodingResult::U8(v) => first_sample(&v, h * w, f32::from),
        DecodingResult::U16(v) => first_sample(&v, h * w, f32::from),
        DecodingResult::U32(v) => first_sample(&v, h * w, |x| x as f32),
        DecodingResult::U64(v) => first_sample(&v, h * w, |x| x as f32),
        DecodingResult::I8(v) => first_sample(&v, h * w, f32::from),
        DecodingResult::I16(v) => first_sample(&v, h * w, f32::from),
        DecodingResult::I32(v) => first_sample(&v, h * w, |x| x as f32),
        DecodingResult::I64(v) => first_sample(&v, h * w, |x| x as f32),
        #[allow(unreachable_patterns)]
        _ => anyhow::bail!("Unsupported TIFF sample format: {}", path.display()),
    }
    .with_context(|| format!("Unexpected TIFF layout: {}", path.display()))?;
    Plane::new(h, w, data)
}

fn first_sample<T: Copy>(
    values: &[T],
    pixels: usize,
    convert: impl Fn(T) -> f32,
) -> anyhow::Result<Vec<f32>> {
    if pixels == 0 || values.len() % pixels != 0 {
        anyhow::bail!("{} samples do not fill {} pixels", values.len(), pixels);
    }
    let samples = values.len() / pixels;
    Ok(values.iter().step_by(samples).map(|&v| convert(v)).collect())
}

/// Loads an RGB image with values in `[0, 255]`.
pub fn load_rgb(path: &Path) -> anyhow::Result<ColourImage> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to open RGB image: {}", path.display()))?
        .to_rgb8();
    let (w, h) = rgb.dimensions();
    let (w, h) = (w as usize, h as usize);

    let mut channels = [
        Plane::zeros(h, w),
        Plane::zeros(h, w),
        Plane::zeros(h, w),
    ];
    for (idx, pixel) in rgb.pixels().enumerate() {
        channels[0].data[idx] = f32::from(pixel[0]);
        channels[1].data[idx] = f32::from(pixel[1]);
        channels[2].data[idx] = f32::from(pixel[2]);
    }
    Ok(ColourImage { channels })
}

pub fn gaussian_filter(src: &[f32], h: usize, w: usize, sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 || h == 0 || w == 0 {
        return src.to_vec();
    }
    let kernel = gaussian_kernel_1d(sigma);
    let half = (kernel.len() / 2) as isize;

    let mut temp = vec![0f32; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let xx = clamp_index(x as isize + k as isize - half, w);
                acc += src[y * w + xx] * weight;
            }
            temp[y * w + x] = acc;
        }
    }

    let mut out = vec![0f32; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let yy = clamp_index(y as isize + k as isize - half, h);
                acc += temp[yy * w + x] * weight;
            }
            out[y * w + x] = acc;
        }
    }
    out
}

pub fn resize_bilinear_channel(
    src: &[f32],
    src_h: usize,
    src_w: usize,
    dst_h: usize,
    dst_w: usize,
) -> Vec<f32> {
    if src_h == dst_h && src_w == dst_w {
        return src.to_vec();
    }
    if src_h == 0 || src_w == 0 {
        return vec![0f32; dst_h * dst_w];
    }

    let mut out = vec![0f32; dst_h * dst_w];
    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    for y in 0..dst_h {
        let in_y = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (src_h - 1) as f32);
        let y0 = in_y.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = in_y - y0 as f32;

        for x in 0..dst_w {
            let in_x = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (src_w - 1) as f32);
            let x0 = in_x.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = in_x - x0 as f32;

            let top = src[y0 * src_w + x0] * (1.0 - wx) + src[y0 * src_w + x1] * wx;
            let bottom = src[y1 * src_w + x0] * (1.0 - wx) + src[y1 * src_w + x1] * wx;
            out[y * dst_w + x] = top * (1.0 - wy) + bottom * wy;
        }
    }

    out
}

/// Kernel truncated at four standard deviations.
fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let half = (4.0 * sigma + 0.5) as isize;
    let mut kernel = Vec::with_capacity((2 * half + 1) as usize);
    let mut sum = 0.0;
    for i in -half..=half {
        let x = i as f32;
        let value = (-x * x / (2.0 * sigma * sigma)).exp();
        kernel.push(value);
        sum += value;
    }
    if sum > 0.0 {
        kernel.iter_mut().for_each(|value| *value /= sum);
    }
    kernel
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Border mode `nearest`: indices past an edge repeat the edge pixel.
fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

/// Continuous-coordinate reflection into `[0, n - 1]`.
fn reflect(v: f64, n: usize) -> f64 {
    let max = (n - 1) as f64;
    if max <= 0.0 {
        return 0.0;
    }
    let period = 2.0 * max;
    let m = v.rem_euclid(period);
    if m <= max {
        m
    } else {
        period - m
    }
}

#[cfg(test)]
pub fn write_depth_tiff(path: &Path, plane: &Plane) -> anyhow::Result<()> {
    use tiff::encoder::{colortype::Gray32Float, TiffEncoder};

    let file = File::create(path)
        .with_context(|| format!("Failed to create depth image: {}", path.display()))?;
    let mut encoder = TiffEncoder::new(file)?;
    encoder.write_image::<Gray32Float>(plane.width as u32, plane.height as u32, &plane.data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> Plane {
        Plane::new(h, w, (0..h * w).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let plane = ramp(4, 5);
        let cropped = plane.crop((1, 2), (10, 4));
        assert_eq!((cropped.height, cropped.width), (3, 2));
        assert_eq!(cropped.data, vec![7.0, 8.0, 12.0, 13.0, 17.0, 18.0]);
    }

    #[test]
    fn quarter_turn_moves_pixels_like_grasp_points() {
        let mut plane = Plane::zeros(5, 5);
        // (row 2, col 4) rotates to (row 4, col 2) about the centre.
        plane.data[2 * 5 + 4] = 1.0;
        let rotated = plane.rotate(std::f64::consts::FRAC_PI_2, [2.0, 2.0]);
        assert!((rotated.at(4, 2) - 1.0).abs() < 1e-5);
        assert!(rotated.at(2, 4).abs() < 1e-5);
    }

    #[test]
    fn zoom_keeps_shape() {
        let plane = ramp(10, 10);
        let zoomed = plane.zoom(0.5);
        assert_eq!((zoomed.height, zoomed.width), (10, 10));
        // Centre of a linear ramp stays near the same value.
        assert!((zoomed.at(5, 5) - plane.at(5, 5)).abs() < 6.0);
    }

    #[test]
    fn depth_normalisation_centres_and_clips() {
        let mut plane = Plane::new(1, 4, vec![0.0, 0.5, 4.0, f32::NAN]).unwrap();
        plane.normalise_depth();
        assert!(plane.data.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(plane.data[2], 1.0);
        assert!((plane.data[1] - (0.5 - 1.125)).abs() < 1e-6);
    }

    #[test]
    fn rgb_normalisation_is_zero_mean() {
        let plane = Plane::new(1, 2, vec![0.0, 255.0]).unwrap();
        let mut img = ColourImage {
            channels: [plane.clone(), plane.clone(), plane],
        };
        img.normalise();
        let total: f32 = img.to_chw().iter().sum();
        assert!(total.abs() < 1e-5);
    }

    #[test]
    fn gaussian_filter_preserves_constant_images() {
        let src = vec![3.0f32; 6 * 7];
        let out = gaussian_filter(&src, 6, 7, 2.0);
        assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-4));
    }

    #[test]
    fn npy_depth_loads_as_plane() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.npy");
        let array = Array2::from_shape_vec((2, 3), vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        ndarray_npy::write_npy(&path, &array).unwrap();
        let plane = load_depth(&path).unwrap();
        assert_eq!((plane.height, plane.width), (2, 3));
        assert_eq!(plane.at(1, 2), 6.0);
    }

    #[test]
    fn gaussian_filter_repeats_edge_pixels() {
        let src: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let out = gaussian_filter(&src, 1, 12, 1.0);
        let kernel = gaussian_kernel_1d(1.0);
        let half = kernel.len() / 2;
        // Everything left of column 0 reads as column 0, which is zero.
        let expected: f32 = kernel[half + 1..]
            .iter()
            .enumerate()
            .map(|(i, w)| w * (i + 1) as f32)
            .sum();
        assert!((out[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn float_tiff_depth_loads_as_plane() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_a_perfect_depth.tiff");
        let plane = Plane::new(3, 4, (0..12).map(|v| 0.25 * v as f32).collect()).unwrap();
        write_depth_tiff(&path, &plane).unwrap();

        let loaded = load_depth(&path).unwrap();
        assert_eq!((loaded.height, loaded.width), (3, 4));
        assert_eq!(loaded.at(2, 3), 2.75);
        assert_eq!(loaded, plane);
    }
}
