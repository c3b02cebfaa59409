use std::f64::consts::{FRAC_PI_2, PI};
use std::fs;
use std::path::Path;

use anyhow::Context;

/// `[row, col]` in image coordinates.
pub type Point = [f64; 2];

/// Angle tolerance used when matching a detected grasp against ground truth.
pub const ANGLE_THRESHOLD: f64 = PI / 6.0;

#[derive(Clone, Debug, PartialEq)]
pub struct GraspRectangle {
    pub points: [Point; 4],
}

#[derive(Clone, Debug, PartialEq)]
pub struct Grasp {
    pub center: Point,
    pub angle: f64,
    pub length: f64,
    pub width: f64,
}

#[derive(Clone, Debug, Default)]
pub struct GraspRectangles {
    pub rects: Vec<GraspRectangle>,
}

/// Rasterised training targets for a set of grasps, each `rows * cols`.
#[derive(Clone, Debug)]
pub struct GraspMaps {
    pub position: Vec<f32>,
    pub angle: Vec<f32>,
    pub width: Vec<f32>,
}

impl GraspRectangle {
    pub fn angle(&self) -> f64 {
        let dx = self.points[1][1] - self.points[0][1];
        let dy = self.points[1][0] - self.points[0][0];
        ((-dy).atan2(dx) + FRAC_PI_2).rem_euclid(PI) - FRAC_PI_2
    }

    pub fn center(&self) -> Point {
        let mut c = [0.0, 0.0];
        for p in &self.points {
            c[0] += p[0] / 4.0;
            c[1] += p[1] / 4.0;
        }
        c
    }

    pub fn length(&self) -> f64 {
        distance(self.points[0], self.points[1])
    }

    pub fn width(&self) -> f64 {
        distance(self.points[1], self.points[2])
    }

    pub fn as_grasp(&self) -> Grasp {
        Grasp {
            center: self.center(),
            angle: self.angle(),
            length: self.length(),
            width: self.width(),
        }
    }

    pub fn rotate(&mut self, angle: f64, center: Point) {
        let (s, c) = angle.sin_cos();
        for p in &mut self.points {
            let dy = p[0] - center[0];
            let dx = p[1] - center[1];
            p[0] = c * dy + s * dx + center[0];
            p[1] = -s * dy + c * dx + center[1];
        }
    }

    /// Scales about `center` so the rectangle follows a centre zoom of the
    /// image by `factor` (< 1 enlarges).
    pub fn zoom(&mut self, factor: f64, center: Point) {
        for p in &mut self.points {
            p[0] = (p[0] - center[0]) / factor + center[0];
            p[1] = (p[1] - center[1]) / factor + center[1];
        }
    }

    pub fn offset(&mut self, offset: Point) {
        for p in &mut self.points {
            p[0] += offset[0];
            p[1] += offset[1];
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for p in &mut self.points {
            p[0] *= factor;
            p[1] *= factor;
        }
    }

    /// Pixels whose centres fall inside the rectangle, clipped to `shape`
    /// when given (and always to non-negative coordinates).
    pub fn polygon_coords(&self, shape: Option<(usize, usize)>) -> Vec<(usize, usize)> {
        polygon_pixels(&self.points, shape)
    }

    /// Polygon of the central third of the grasp, used for the position map.
    pub fn compact_polygon_coords(&self, shape: Option<(usize, usize)>) -> Vec<(usize, usize)> {
        let grasp = self.as_grasp();
        Grasp {
            length: grasp.length / 3.0,
            ..grasp
        }
        .as_rectangle()
        .polygon_coords(shape)
    }

    /// Pixel IoU of two rectangles, zero when their angles differ by more
    /// than `angle_threshold`.
    pub fn iou(&self, other: &GraspRectangle, angle_threshold: f64) -> f64 {
        let angle_diff = (self.angle() - other.angle() + FRAC_PI_2).rem_euclid(PI) - FRAC_PI_2;
        if angle_diff.abs() > angle_threshold {
            return 0.0;
        }

        let a = self.polygon_coords(None);
        let b = other.polygon_coords(None);
        let rows = a.iter().chain(b.iter()).map(|(r, _)| r + 1).max().unwrap_or(0);
        let cols = a.iter().chain(b.iter()).map(|(_, c)| c + 1).max().unwrap_or(0);
        if rows == 0 || cols == 0 {
            return 0.0;
        }

        let mut canvas = vec![0u8; rows * cols];
        for (r, c) in a.iter().chain(b.iter()) {
            canvas[r * cols + c] += 1;
        }
        let union = canvas.iter().filter(|v| **v > 0).count();
        if union == 0 {
            return 0.0;
        }
        let intersection = canvas.iter().filter(|v| **v == 2).count();
        intersection as f64 / union as f64
    }
}

impl Grasp {
    pub fn as_rectangle(&self) -> GraspRectangle {
        let (yo, xo) = self.angle.sin_cos();
        let [cy, cx] = self.center;
        let half_len = self.length / 2.0;
        let half_w = self.width / 2.0;

        let y1 = cy + half_len * yo;
        let x1 = cx - half_len * xo;
        let y2 = cy - half_len * yo;
        let x2 = cx + half_len * xo;

        GraspRectangle {
            points: [
                [y1 - half_w * xo, x1 - half_w * yo],
                [y2 - half_w * xo, x2 - half_w * yo],
                [y2 + half_w * xo, x2 + half_w * yo],
                [y1 + half_w * xo, x1 + half_w * yo],
            ],
        }
    }

    pub fn max_iou(&self, rects: &GraspRectangles) -> f64 {
        let own = self.as_rectangle();
        rects
            .rects
            .iter()
            .map(|gt| own.iou(gt, ANGLE_THRESHOLD))
            .fold(0.0, f64::max)
    }
}

impl GraspRectangles {
    pub fn from_cornell_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read grasp file: {}", path.display()))?;
        Ok(Self::from_cornell_str(&text))
    }

    /// Cornell files list four `x y` corner lines per rectangle. Rectangles
    /// containing non-finite values are skipped.
    pub fn from_cornell_str(text: &str) -> Self {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let mut rects = Vec::new();
        for group in lines.chunks_exact(4) {
            let points: Option<Vec<Point>> = group.iter().map(|line| parse_cornell_point(line)).collect();
            if let Some(points) = points {
                rects.push(GraspRectangle {
                    points: [points[0], points[1], points[2], points[3]],
                });
            }
        }
        Self { rects }
    }

    pub fn from_jacquard_file(path: &Path, scale: f64) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read grasp file: {}", path.display()))?;
        Self::from_jacquard_str(&text, scale)
            .with_context(|| format!("Malformed Jacquard grasp file: {}", path.display()))
    }

    /// Jacquard files hold one `x;y;theta;w;h` grasp per line, theta in degrees.
    pub fn from_jacquard_str(text: &str, scale: f64) -> anyhow::Result<Self> {
        let mut rects = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let values: Vec<f64> = line
                .split(';')
                .map(|v| v.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .with_context(|| format!("Line {}: expected numeric fields", line_no + 1))?;
            if values.len() != 5 {
                anyhow::bail!(
                    "Line {}: expected 5 fields (x;y;theta;w;h), got {}",
                    line_no + 1,
                    values.len()
                );
            }
            let (x, y, theta, w, h) = (values[0], values[1], values[2], values[3], values[4]);
            rects.push(
                Grasp {
                    center: [y, x],
                    angle: -theta / 180.0 * PI,
                    length: w,
                    width: h,
                }
                .as_rectangle(),
            );
        }
        let mut grs = Self { rects };
        grs.scale(scale);
        Ok(grs)
    }

    /// Mean of all corner points, truncated to whole pixels.
    pub fn center(&self) -> [i64; 2] {
        let count = (self.rects.len() * 4).max(1) as f64;
        let mut sum = [0.0f64; 2];
        for rect in &self.rects {
            for p in &rect.points {
                sum[0] += p[0];
                sum[1] += p[1];
            }
        }
        [(sum[0] / count) as i64, (sum[1] / count) as i64]
    }

    pub fn rotate(&mut self, angle: f64, center: Point) {
        self.rects.iter_mut().for_each(|r| r.rotate(angle, center));
    }

    pub fn zoom(&mut self, factor: f64, center: Point) {
        self.rects.iter_mut().for_each(|r| r.zoom(factor, center));
    }

    pub fn offset(&mut self, offset: Point) {
        self.rects.iter_mut().for_each(|r| r.offset(offset));
    }

    pub fn scale(&mut self, factor: f64) {
        self.rects.iter_mut().for_each(|r| r.scale(factor));
    }

    pub fn draw(&self, shape: (usize, usize)) -> GraspMaps {
        let pixels = shape.0 * shape.1;
        let mut maps = GraspMaps {
            position: vec![0.0; pixels],
            angle: vec![0.0; pixels],
            width: vec![0.0; pixels],
        };
        for rect in &self.rects {
            let angle = rect.angle() as f32;
            let length = rect.length() as f32;
            for (r, c) in rect.compact_polygon_coords(Some(shape)) {
                let idx = r * shape.1 + c;
                maps.position[idx] = 1.0;
                maps.angle[idx] = angle;
                maps.width[idx] = length;
            }
        }
        maps
    }
}

/// Detects up to `no_grasps` grasps from the quality map. Each peak takes
/// its angle and length from the corresponding maps.
pub fn detect_grasps(
    q: &[f32],
    angle: &[f32],
    width: &[f32],
    shape: (usize, usize),
    no_grasps: usize,
) -> Vec<Grasp> {
    peak_local_max(q, shape, 20, 0.2, no_grasps)
        .into_iter()
        .map(|(r, c)| {
            let idx = r * shape.1 + c;
            let length = f64::from(width[idx]);
            Grasp {
                center: [r as f64, c as f64],
                angle: f64::from(angle[idx]),
                length,
                width: length / 2.0,
            }
        })
        .collect()
}

/// Local maxima above `threshold` in a `(2 * min_distance + 1)` window,
/// excluding a `min_distance` border, strongest first.
pub fn peak_local_max(
    image: &[f32],
    shape: (usize, usize),
    min_distance: usize,
    threshold: f32,
    num_peaks: usize,
) -> Vec<(usize, usize)> {
    let (rows, cols) = shape;
    if rows <= 2 * min_distance || cols <= 2 * min_distance || num_peaks == 0 {
        return Vec::new();
    }
    let filtered = maximum_filter(image, shape, min_distance);

    let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
    for r in min_distance..rows - min_distance {
        for c in min_distance..cols - min_distance {
            let idx = r * cols + c;
            let value = image[idx];
            if value > threshold && value == filtered[idx] {
                candidates.push((r, c, value));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut peaks: Vec<(usize, usize)> = Vec::new();
    for (r, c, _) in candidates {
        let too_close = peaks
            .iter()
            .any(|(pr, pc)| pr.abs_diff(r) <= min_distance && pc.abs_diff(c) <= min_distance);
        if too_close {
            continue;
        }
        peaks.push((r, c));
        if peaks.len() == num_peaks {
            break;
        }
    }
    peaks
}

fn maximum_filter(image: &[f32], shape: (usize, usize), radius: usize) -> Vec<f32> {
    let (rows, cols) = shape;
    let mut horizontal = vec![0f32; image.len()];
    for r in 0..rows {
        for c in 0..cols {
            let lo = c.saturating_sub(radius);
            let hi = (c + radius).min(cols - 1);
            horizontal[r * cols + c] = image[r * cols + lo..=r * cols + hi]
                .iter()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max);
        }
    }

    let mut out = vec![0f32; image.len()];
    for c in 0..cols {
        for r in 0..rows {
            let lo = r.saturating_sub(radius);
            let hi = (r + radius).min(rows - 1);
            out[r * cols + c] = (lo..=hi)
                .map(|rr| horizontal[rr * cols + c])
                .fold(f32::NEG_INFINITY, f32::max);
        }
    }
    out
}

fn parse_cornell_point(line: &str) -> Option<Point> {
    let mut parts = line.split_whitespace();
    let x: f64 = parts.next()?.parse().ok()?;
    let y: f64 = parts.next()?.parse().ok()?;
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    Some([y.round(), x.round()])
}

fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn polygon_pixels(points: &[Point; 4], shape: Option<(usize, usize)>) -> Vec<(usize, usize)> {
    let min_r = points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
    let max_r = points.iter().map(|p| p[0]).fold(f64::NEG_INFINITY, f64::max);
    let min_c = points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
    let max_c = points.iter().map(|p| p[1]).fold(f64::NEG_INFINITY, f64::max);
    if !(min_r.is_finite() && max_r.is_finite() && min_c.is_finite() && max_c.is_finite()) {
        return Vec::new();
    }

    let r_start = min_r.floor().max(0.0) as usize;
    let c_start = min_c.floor().max(0.0) as usize;
    if max_r < 0.0 || max_c < 0.0 {
        return Vec::new();
    }
    let mut r_end = max_r.ceil() as usize;
    let mut c_end = max_c.ceil() as usize;
    if let Some((rows, cols)) = shape {
        if rows == 0 || cols == 0 {
            return Vec::new();
        }
        r_end = r_end.min(rows - 1);
        c_end = c_end.min(cols - 1);
    }

    let mut out = Vec::new();
    for r in r_start..=r_end {
        for c in c_start..=c_end {
            if point_in_polygon(points, r as f64, c as f64) {
                out.push((r, c));
            }
        }
    }
    out
}

fn point_in_polygon(points: &[Point; 4], r: f64, c: f64) -> bool {
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (ri, ci) = (points[i][0], points[i][1]);
        let (rj, cj) = (points[j][0], points[j][1]);
        if (ri > r) != (rj > r) && c < (cj - ci) * (r - ri) / (rj - ri) + ci {
            inside = !inside;
        }
        j = i;
    }
    inside
}
