use std::sync::Arc;

use anyhow::Context;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::dataset::{GraspDataset, GraspSample};

/// A collated batch on the training device. Targets are `(N, 1, H, W)`.
pub struct Batch {
    pub inputs: Tensor,
    pub position: Tensor,
    pub cos: Tensor,
    pub sin: Tensor,
    pub width: Tensor,
    pub samples: Vec<SampleMeta>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleMeta {
    pub index: usize,
    pub rot: f64,
    pub zoom: f64,
}

/// Batches dataset items, loading them on a worker pool when
/// `num_workers > 0`.
pub struct GraspLoader {
    dataset: Arc<GraspDataset>,
    batch_size: usize,
    shuffle: bool,
    pool: Option<ThreadPool>,
}

impl GraspLoader {
    pub fn new(
        dataset: Arc<GraspDataset>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("grasp-loader-{i}"))
                    .build()
                    .context("Failed to build data loader worker pool")?,
            )
        } else {
            None
        };
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            pool,
        })
    }

    pub fn dataset(&self) -> &GraspDataset {
        &self.dataset
    }

    /// Number of batches per pass, keeping the last partial batch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Index groups for one pass over the dataset.
    pub fn epoch_batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn load_batch(
        &self,
        indices: &[usize],
        rng: &mut StdRng,
        device: &Device,
    ) -> anyhow::Result<Batch> {
        // Seeds are drawn up front so augmentation does not depend on which
        // worker picks up which item.
        let jobs: Vec<(usize, u64)> = indices.iter().map(|&i| (i, rng.random())).collect();
        let load = |&(index, seed): &(usize, u64)| {
            let mut item_rng = StdRng::seed_from_u64(seed);
            self.dataset.load_item(index, &mut item_rng)
        };

        let samples: Vec<GraspSample> = match &self.pool {
            Some(pool) => pool.install(|| jobs.par_iter().map(load).collect::<anyhow::Result<_>>())?,
            None => jobs.iter().map(load).collect::<anyhow::Result<_>>()?,
        };
        collate(&samples, self.dataset.input_channels(), self.dataset.cfg.output_size, device)
    }
}

/// Stacks samples into device tensors.
pub fn collate(
    samples: &[GraspSample],
    channels: usize,
    size: usize,
    device: &Device,
) -> anyhow::Result<Batch> {
    if samples.is_empty() {
        anyhow::bail!("Cannot collate an empty batch");
    }
    let cpu = Device::Cpu;
    let n = samples.len();
    let pixels = size * size;

    let mut inputs = Vec::with_capacity(n * channels * pixels);
    let mut position = Vec::with_capacity(n * pixels);
    let mut cos = Vec::with_capacity(n * pixels);
    let mut sin = Vec::with_capacity(n * pixels);
    let mut width = Vec::with_capacity(n * pixels);
    for sample in samples {
        if sample.input.len() != channels * pixels {
            anyhow::bail!(
                "Sample {} has {} input values, expected {}",
                sample.index,
                sample.input.len(),
                channels * pixels
            );
        }
        inputs.extend_from_slice(&sample.input);
        position.extend_from_slice(&sample.position);
        cos.extend_from_slice(&sample.cos);
        sin.extend_from_slice(&sample.sin);
        width.extend_from_slice(&sample.width);
    }

    let target = |data: Vec<f32>| -> anyhow::Result<Tensor> {
        Ok(Tensor::from_vec(data, (n, 1, size, size), &cpu)
            .context("Failed to build target tensor")?
            .to_device(device)?)
    };

    Ok(Batch {
        inputs: Tensor::from_vec(inputs, (n, channels, size, size), &cpu)
            .context("Failed to build input tensor")?
            .to_device(device)?,
        position: target(position)?,
        cos: target(cos)?,
        sin: target(sin)?,
        width: target(width)?,
        samples: samples
            .iter()
            .map(|s| SampleMeta {
                index: s.index,
                rot: s.rot,
                zoom: s.zoom,
            })
            .collect(),
    })
}

/// Endless batch source that starts a new pass over the loader whenever the
/// current one runs out.
pub struct BatchStream<'a> {
    loader: &'a GraspLoader,
    pending: std::vec::IntoIter<Vec<usize>>,
}

impl<'a> BatchStream<'a> {
    pub fn new(loader: &'a GraspLoader) -> Self {
        Self {
            loader,
            pending: Vec::new().into_iter(),
        }
    }

    pub fn next_batch(&mut self, rng: &mut StdRng, device: &Device) -> anyhow::Result<Batch> {
        if self.loader.is_empty() {
            anyhow::bail!("Cannot draw batches from an empty dataset");
        }
        let indices = match self.pending.next() {
            Some(indices) => indices,
            None => {
                self.pending = self.loader.epoch_batches(rng).into_iter();
                self.pending
                    .next()
                    .context("Data loader produced no batches")?
            }
        };
        self.loader.load_batch(&indices, rng, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetKind;
    use crate::dataset::{DatasetConfig, GraspEntry};
    use std::path::PathBuf;

    fn dataset_of(len: usize) -> Arc<GraspDataset> {
        let entries = (0..len)
            .map(|i| GraspEntry {
                grasp_path: PathBuf::from(format!("{i}_grasps.txt")),
                depth_path: PathBuf::from(format!("{i}_perfect_depth.tiff")),
                rgb_path: PathBuf::from(format!("{i}_RGB.png")),
            })
            .collect();
        let cfg = DatasetConfig {
            kind: DatasetKind::Jacquard,
            output_size: 4,
            include_depth: true,
            include_rgb: false,
            random_rotate: false,
            random_zoom: false,
        };
        Arc::new(GraspDataset::new(entries, cfg).unwrap())
    }

    fn sample(index: usize) -> GraspSample {
        GraspSample {
            input: vec![index as f32; 16],
            position: vec![1.0; 16],
            cos: vec![1.0; 16],
            sin: vec![0.0; 16],
            width: vec![0.5; 16],
            index,
            rot: 0.0,
            zoom: 1.0,
        }
    }

    #[test]
    fn epoch_keeps_last_partial_batch() {
        let loader = GraspLoader::new(dataset_of(10), 4, false, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = loader.epoch_batches(&mut rng);
        assert_eq!(loader.len(), 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![8, 9]);
    }

    #[test]
    fn shuffled_epoch_covers_every_index_once() {
        let loader = GraspLoader::new(dataset_of(9), 2, true, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut all: Vec<usize> = loader.epoch_batches(&mut rng).concat();
        all.sort();
        assert_eq!(all, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn collate_stacks_samples() {
        let samples = vec![sample(0), sample(1), sample(2)];
        let batch = collate(&samples, 1, 4, &Device::Cpu).unwrap();
        assert_eq!(batch.inputs.dims(), &[3, 1, 4, 4]);
        assert_eq!(batch.width.dims(), &[3, 1, 4, 4]);
        assert_eq!(batch.samples[2].index, 2);
    }

    #[test]
    fn collate_rejects_empty_and_misshaped_batches() {
        assert!(collate(&[], 1, 4, &Device::Cpu).is_err());
        assert!(collate(&[sample(0)], 2, 4, &Device::Cpu).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(GraspLoader::new(dataset_of(3), 0, false, 0).is_err());
    }
}
