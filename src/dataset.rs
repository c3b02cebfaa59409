use std::f64::consts::{FRAC_PI_2, PI};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::config::DatasetKind;
use crate::grasp::GraspRectangles;
use crate::imaging::{load_depth, load_rgb, ColourImage, Plane};

const CORNELL_HEIGHT: usize = 480;
const CORNELL_WIDTH: usize = 640;
const JACQUARD_SIZE: f64 = 1024.0;
/// Grasp widths are clipped to this many pixels and scaled to `[0, 1]`.
pub const MAX_GRASP_WIDTH: f32 = 150.0;

const ROTATIONS: [f64; 4] = [0.0, FRAC_PI_2, PI, 3.0 * FRAC_PI_2];

#[derive(Clone, Debug)]
pub struct GraspEntry {
    pub grasp_path: PathBuf,
    pub depth_path: PathBuf,
    pub rgb_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub kind: DatasetKind,
    pub output_size: usize,
    pub include_depth: bool,
    pub include_rgb: bool,
    pub random_rotate: bool,
    pub random_zoom: bool,
}

/// One network input with its targets, all `output_size` square.
#[derive(Debug)]
pub struct GraspSample {
    pub input: Vec<f32>,
    pub position: Vec<f32>,
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
    pub width: Vec<f32>,
    pub index: usize,
    pub rot: f64,
    pub zoom: f64,
}

#[derive(Clone, Debug)]
pub struct GraspDataset {
    pub entries: Vec<GraspEntry>,
    pub cfg: DatasetConfig,
}

struct CropAttrs {
    center: [f64; 2],
    top: usize,
    left: usize,
}

impl GraspDataset {
    /// Discovers the dataset under `root` and keeps the `[start, end)`
    /// fraction after rotating the file list by `ds_rotate`.
    pub fn open(
        root: &Path,
        start: f64,
        end: f64,
        ds_rotate: f64,
        cfg: DatasetConfig,
    ) -> anyhow::Result<Self> {
        let entries = discover_entries(root, cfg.kind)?;
        if entries.is_empty() {
            anyhow::bail!("No dataset files found. Check path: {}", root.display());
        }
        let entries = window_entries(entries, start, end, ds_rotate);
        Self::new(entries, cfg)
    }

    pub fn new(entries: Vec<GraspEntry>, cfg: DatasetConfig) -> anyhow::Result<Self> {
        if !cfg.include_depth && !cfg.include_rgb {
            anyhow::bail!("At least one of depth or rgb must be enabled");
        }
        Ok(Self { entries, cfg })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn input_channels(&self) -> usize {
        usize::from(self.cfg.include_depth) + 3 * usize::from(self.cfg.include_rgb)
    }

    pub fn load_item(&self, index: usize, rng: &mut StdRng) -> anyhow::Result<GraspSample> {
        let rot = if self.cfg.random_rotate {
            ROTATIONS.choose(rng).copied().unwrap_or(0.0)
        } else {
            0.0
        };
        let zoom = if self.cfg.random_zoom {
            rng.random_range(0.5..1.0)
        } else {
            1.0
        };
        self.load_item_with(index, rot, zoom)
    }

    pub fn load_item_with(&self, index: usize, rot: f64, zoom: f64) -> anyhow::Result<GraspSample> {
        let size = self.cfg.output_size;
        let pixels = size * size;

        let mut input = Vec::with_capacity(self.input_channels() * pixels);
        if self.cfg.include_depth {
            input.extend_from_slice(&self.depth(index, rot, zoom)?.data);
        }
        if self.cfg.include_rgb {
            input.extend_from_slice(&self.rgb(index, rot, zoom)?.to_chw());
        }

        let maps = self.ground_truth(index, rot, zoom)?.draw((size, size));
        let cos = maps.angle.iter().map(|a| (2.0 * a).cos()).collect();
        let sin = maps.angle.iter().map(|a| (2.0 * a).sin()).collect();
        let width = maps
            .width
            .iter()
            .map(|w| w.clamp(0.0, MAX_GRASP_WIDTH) / MAX_GRASP_WIDTH)
            .collect();

        Ok(GraspSample {
            input,
            position: maps.position,
            cos,
            sin,
            width,
            index,
            rot,
            zoom,
        })
    }

    /// Ground-truth rectangles for an item, transformed the same way as its
    /// images.
    pub fn ground_truth(&self, index: usize, rot: f64, zoom: f64) -> anyhow::Result<GraspRectangles> {
        let entry = self.entry(index)?;
        let half = (self.cfg.output_size / 2) as f64;
        match self.cfg.kind {
            DatasetKind::Cornell => {
                let mut gtbbs = GraspRectangles::from_cornell_file(&entry.grasp_path)?;
                let attrs = self.cornell_crop_attrs(&gtbbs);
                gtbbs.rotate(rot, attrs.center);
                gtbbs.offset([-(attrs.top as f64), -(attrs.left as f64)]);
                gtbbs.zoom(zoom, [half, half]);
                Ok(gtbbs)
            }
            DatasetKind::Jacquard => {
                let scale = self.cfg.output_size as f64 / JACQUARD_SIZE;
                let mut gtbbs = GraspRectangles::from_jacquard_file(&entry.grasp_path, scale)?;
                gtbbs.rotate(rot, [half, half]);
                gtbbs.zoom(zoom, [half, half]);
                Ok(gtbbs)
            }
        }
    }

    fn depth(&self, index: usize, rot: f64, zoom: f64) -> anyhow::Result<Plane> {
        let entry = self.entry(index)?;
        let size = self.cfg.output_size;
        let depth = load_depth(&entry.depth_path)?;
        let mut depth = match self.cfg.kind {
            DatasetKind::Cornell => {
                let attrs = self.cornell_crop_attrs(&GraspRectangles::from_cornell_file(
                    &entry.grasp_path,
                )?);
                depth
                    .rotate(rot, attrs.center)
                    .crop((attrs.top, attrs.left), (attrs.top + size, attrs.left + size))
            }
            DatasetKind::Jacquard => {
                let center = image_center(&depth);
                depth.rotate(rot, center)
            }
        };
        depth.normalise_depth();
        Ok(depth.zoom(zoom).resize(size, size))
    }

    fn rgb(&self, index: usize, rot: f64, zoom: f64) -> anyhow::Result<ColourImage> {
        let entry = self.entry(index)?;
        let size = self.cfg.output_size;
        let rgb = load_rgb(&entry.rgb_path)?;
        let rgb = match self.cfg.kind {
            DatasetKind::Cornell => {
                let attrs = self.cornell_crop_attrs(&GraspRectangles::from_cornell_file(
                    &entry.grasp_path,
                )?);
                rgb.map(|p| {
                    p.rotate(rot, attrs.center)
                        .crop((attrs.top, attrs.left), (attrs.top + size, attrs.left + size))
                })
            }
            DatasetKind::Jacquard => {
                let center = image_center(&rgb.channels[0]);
                rgb.map(|p| p.rotate(rot, center))
            }
        };
        let mut rgb = rgb.map(|p| p.zoom(zoom).resize(size, size));
        rgb.normalise();
        Ok(rgb)
    }

    fn cornell_crop_attrs(&self, gtbbs: &GraspRectangles) -> CropAttrs {
        let size = self.cfg.output_size as i64;
        let center = gtbbs.center();
        let left = (center[1] - size / 2).min(CORNELL_WIDTH as i64 - size).max(0);
        let top = (center[0] - size / 2).min(CORNELL_HEIGHT as i64 - size).max(0);
        CropAttrs {
            center: [center[0] as f64, center[1] as f64],
            top: top as usize,
            left: left as usize,
        }
    }

    fn entry(&self, index: usize) -> anyhow::Result<&GraspEntry> {
        self.entries
            .get(index)
            .with_context(|| format!("Sample index out of bounds: {index}"))
    }
}

/// Lists grasp files with their depth and RGB companions, sorted by grasp
/// path. Cornell keeps `<root>/*/pcd*cpos.txt`; Jacquard keeps
/// `<root>/*/*/*_grasps.txt`.
pub fn discover_entries(root: &Path, kind: DatasetKind) -> anyhow::Result<Vec<GraspEntry>> {
    if !root.exists() {
        anyhow::bail!("Dataset root does not exist: {}", root.display());
    }

    let mut entries = Vec::new();
    match kind {
        DatasetKind::Cornell => {
            for dir in sorted_subdirs(root)? {
                for grasp_path in sorted_files(&dir, |name| {
                    name.starts_with("pcd") && name.ends_with("cpos.txt")
                })? {
                    let base = strip_suffix(&grasp_path, "cpos.txt");
                    entries.push(GraspEntry {
                        depth_path: resolve_depth_path(&base, "d"),
                        rgb_path: PathBuf::from(format!("{base}r.png")),
                        grasp_path,
                    });
                }
            }
        }
        DatasetKind::Jacquard => {
            for outer in sorted_subdirs(root)? {
                for dir in sorted_subdirs(&outer)? {
                    for grasp_path in sorted_files(&dir, |name| name.ends_with("_grasps.txt"))? {
                        let base = strip_suffix(&grasp_path, "grasps.txt");
                        entries.push(GraspEntry {
                            depth_path: resolve_depth_path(&base, "perfect_depth"),
                            rgb_path: PathBuf::from(format!("{base}RGB.png")),
                            grasp_path,
                        });
                    }
                }
            }
        }
    }
    entries.sort_by(|a, b| a.grasp_path.cmp(&b.grasp_path));
    Ok(entries)
}

/// Rotates `items` left by `floor(len * ds_rotate)` and keeps
/// `[floor(len * start), floor(len * end))`.
pub fn window_entries<T>(mut items: Vec<T>, start: f64, end: f64, ds_rotate: f64) -> Vec<T> {
    let len = items.len();
    if len == 0 {
        return items;
    }
    let shift = ((len as f64 * ds_rotate) as usize).min(len);
    items.rotate_left(shift % len);

    let lo = ((len as f64 * start) as usize).min(len);
    let hi = ((len as f64 * end) as usize).clamp(lo, len);
    items.truncate(hi);
    items.drain(..lo);
    items
}

fn image_center(plane: &Plane) -> [f64; 2] {
    [plane.height as f64 / 2.0, plane.width as f64 / 2.0]
}

fn strip_suffix(path: &Path, suffix: &str) -> String {
    let full = path.to_string_lossy();
    full.strip_suffix(suffix).unwrap_or(&full).to_string()
}

/// Depth maps are usually TIFF; pre-converted `.npy` arrays are accepted
/// when present.
fn resolve_depth_path(base: &str, stem_suffix: &str) -> PathBuf {
    let tiff = PathBuf::from(format!("{base}{stem_suffix}.tiff"));
    ["tiff", "tif", "npy", "png"]
        .iter()
        .map(|ext| PathBuf::from(format!("{base}{stem_suffix}.{ext}")))
        .find(|candidate| candidate.exists())
        .unwrap_or(tiff)
}

fn sorted_subdirs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset dir: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn sorted_files(dir: &Path, keep: impl Fn(&str) -> bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset dir: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(&keep)
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
