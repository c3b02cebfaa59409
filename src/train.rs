use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::checkpoint::{iou_from_counts, save_checkpoint, CheckpointPolicy};
use crate::config::{DatasetKind, TrainConfig};
use crate::dataset::{DatasetConfig, GraspDataset};
use crate::evaluation::{calculate_iou_match, post_process_output};
use crate::loader::{Batch, BatchStream, GraspLoader};
use crate::model::{
    architecture_summary, build_network, compute_loss, GraspLoss, GraspNet, GraspPrediction,
    HEAD_LOSS_NAMES,
};
use crate::preview::{save_preview_montage, MapSet};
use crate::summary::ScalarWriter;

const LOG_EVERY_BATCHES: usize = 100;

#[derive(Debug, Clone, Default)]
struct LossTotals {
    loss: f64,
    losses: Vec<(String, f64)>,
    batches: usize,
}

impl LossTotals {
    fn add(&mut self, loss: &GraspLoss) -> anyhow::Result<f64> {
        let total = f64::from(loss.total.to_scalar::<f32>()?);
        if self.losses.is_empty() {
            self.losses = HEAD_LOSS_NAMES
                .iter()
                .map(|name| (name.to_string(), 0.0))
                .collect();
        }
        for ((_, acc), head) in self.losses.iter_mut().zip(loss.heads.iter()) {
            *acc += f64::from(head.to_scalar::<f32>()?);
        }
        self.loss += total;
        self.batches += 1;
        Ok(total)
    }

    fn mean(mut self) -> Self {
        if self.batches > 0 {
            let n = self.batches as f64;
            self.loss /= n;
            self.losses.iter_mut().for_each(|(_, v)| *v /= n);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainResults {
    pub loss: f64,
    pub losses: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResults {
    pub loss: f64,
    pub losses: Vec<(String, f64)>,
    pub correct: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
struct EpochSummary {
    epoch: usize,
    train: TrainResults,
    val: ValidationResults,
    iou: f64,
    saved: bool,
    epoch_seconds: f64,
}

/// Entry point: a single run, or one run per `--sweep` subdirectory.
pub fn run_training(cfg: &TrainConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    if cfg.is_sweep() {
        return run_sweep(cfg);
    }

    let kind = cfg.dataset.context("--dataset is required")?;
    let run_id = cfg.run_id(&Utc::now().format("%Y%m%d-%H%M%S").to_string());
    let save_dir = PathBuf::from(&cfg.output_dir).expand_home().join(&run_id);
    let log_dir = prepare_run_dirs(&save_dir)?;
    let dataset_path = PathBuf::from(&cfg.dataset_path).expand_home();

    info!("Run ID: {run_id}");
    run(cfg, kind, &dataset_path, &save_dir, &log_dir)?;
    info!("Artifacts written to: {}", save_dir.display());
    Ok(())
}

/// Trains each listed dataset subdirectory in turn into
/// `<output_dir>/<name>`, replacing any previous output there.
pub fn run_sweep(cfg: &TrainConfig) -> anyhow::Result<()> {
    let root = PathBuf::from(&cfg.dataset_path).expand_home();
    let out_root = PathBuf::from(&cfg.output_dir).expand_home();

    for name in &cfg.sweep {
        let kind = DatasetKind::from_alias(name);
        let mut run_cfg = cfg.clone();
        run_cfg.dataset = Some(kind);
        run_cfg.description = format!("train {name}");
        run_cfg.dataset_path = root.join(name).to_string_lossy().to_string();
        run_cfg.sweep.clear();

        let save_dir = out_root.join(name);
        let log_dir = prepare_run_dirs(&save_dir)?;
        info!("{run_cfg:?}");
        run(&run_cfg, kind, &root.join(name), &save_dir, &log_dir)?;
    }
    Ok(())
}

/// Removes an existing save folder and recreates it with a `logs/` child.
pub fn prepare_run_dirs(save_dir: &Path) -> anyhow::Result<PathBuf> {
    if save_dir.exists() {
        fs::remove_dir_all(save_dir).with_context(|| {
            format!("Failed clearing output directory: {}", save_dir.display())
        })?;
    }
    let log_dir = save_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed creating log directory: {}", log_dir.display()))?;
    Ok(log_dir)
}

/// Trains one network end to end and returns the IOU of the last saved
/// checkpoint.
pub fn run(
    cfg: &TrainConfig,
    kind: DatasetKind,
    dataset_path: &Path,
    save_dir: &Path,
    log_dir: &Path,
) -> anyhow::Result<f64> {
    let mut tb = ScalarWriter::create(log_dir)?;

    let config_path = save_dir.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    info!("Loading {} Dataset...", kind.title());
    let dataset_cfg = DatasetConfig {
        kind,
        output_size: cfg.output_size,
        include_depth: cfg.include_depth(),
        include_rgb: cfg.include_rgb(),
        random_rotate: true,
        random_zoom: true,
    };
    let train_dataset = Arc::new(GraspDataset::open(
        dataset_path,
        0.0,
        cfg.split,
        cfg.ds_rotate,
        dataset_cfg.clone(),
    )?);
    let val_dataset = Arc::new(GraspDataset::open(
        dataset_path,
        cfg.split,
        1.0,
        cfg.ds_rotate,
        dataset_cfg,
    )?);
    if train_dataset.is_empty() {
        anyhow::bail!("Training split is empty; increase --split or add data");
    }
    if val_dataset.is_empty() {
        warn!("Validation split is empty; IOU will be reported as 0");
    }
    let train_loader = GraspLoader::new(train_dataset, cfg.batch_size, true, cfg.num_workers)?;
    let val_loader = GraspLoader::new(val_dataset, 1, false, cfg.num_workers)?;
    info!(
        "Done: train={} samples ({} batches per pass), val={} samples",
        train_loader.dataset().len(),
        train_loader.len(),
        val_loader.dataset().len()
    );

    info!("Loading Network...");
    let input_channels = cfg.input_channels();
    let device = resolve_device(&cfg.device)?;
    info!("Using device: {device:?}");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = build_network(cfg.network, input_channels, vb)?;
    let adam_params = ParamsAdamW {
        lr: cfg.lr,
        weight_decay: cfg.weight_decay,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), adam_params)?;
    info!("Done");

    let arch = architecture_summary(
        net.as_ref(),
        &varmap,
        input_channels,
        cfg.output_size,
        &device,
    )?;
    info!("Model architecture ({}):\n{arch}", cfg.network.name());
    let arch_path = save_dir.join("arch.txt");
    fs::write(&arch_path, &arch)
        .with_context(|| format!("Failed writing architecture: {}", arch_path.display()))?;

    let vis_dir = cfg.vis.then(|| save_dir.join("vis"));
    let mut train_rng = StdRng::seed_from_u64(cfg.seed);
    let mut val_rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
    let mut train_stream = BatchStream::new(&train_loader);
    let mut policy = CheckpointPolicy::new();
    let mut history = Vec::with_capacity(cfg.epochs);

    for epoch in 0..cfg.epochs {
        let epoch_started = Instant::now();
        info!("Beginning Epoch {epoch:02}");
        let train_results = train(
            epoch,
            net.as_ref(),
            &device,
            &mut train_stream,
            &mut optimizer,
            cfg.batches_per_epoch,
            vis_dir.as_deref(),
            &mut train_rng,
        )?;

        tb.add_scalar("loss/train_loss", train_results.loss, epoch)?;
        for (name, value) in &train_results.losses {
            tb.add_scalar(&format!("train_loss/{name}"), *value, epoch)?;
        }

        info!("Validating...");
        let val_results = validate(
            net.as_ref(),
            &device,
            &val_loader,
            cfg.val_batches,
            &mut val_rng,
        )?;
        let iou = iou_from_counts(val_results.correct, val_results.failed);
        info!(
            "{}/{} = {:.6}",
            val_results.correct,
            val_results.correct + val_results.failed,
            iou
        );

        tb.add_scalar("loss/IOU", iou, epoch)?;
        tb.add_scalar("loss/val_loss", val_results.loss, epoch)?;
        for (name, value) in &val_results.losses {
            tb.add_scalar(&format!("val_loss/{name}"), *value, epoch)?;
        }
        tb.flush()?;

        let saved = policy.observe(epoch, iou);
        if saved {
            let checkpoint = save_checkpoint(
                save_dir,
                &varmap,
                cfg.network,
                input_channels,
                cfg.output_size,
                epoch,
                iou,
            )?;
            info!(
                "Saved checkpoint: {} ({})",
                checkpoint.model_path.display(),
                checkpoint.weights_path.display()
            );
        }

        history.push(EpochSummary {
            epoch,
            train: train_results,
            val: val_results,
            iou,
            saved,
            epoch_seconds: epoch_started.elapsed().as_secs_f64(),
        });
    }

    let history_path = save_dir.join("metrics_history.json");
    fs::write(&history_path, serde_json::to_string_pretty(&history)?).with_context(|| {
        format!(
            "Failed writing training history: {}",
            history_path.display()
        )
    })?;

    Ok(policy.best_iou())
}

/// Runs `batches_per_epoch` optimiser steps, drawing batches from the
/// stream across loader passes.
#[allow(clippy::too_many_arguments)]
pub fn train(
    epoch: usize,
    net: &dyn GraspNet,
    device: &Device,
    stream: &mut BatchStream<'_>,
    optimizer: &mut AdamW,
    batches_per_epoch: usize,
    vis_dir: Option<&Path>,
    rng: &mut StdRng,
) -> anyhow::Result<TrainResults> {
    let progress = ProgressBar::new(batches_per_epoch as u64);
    progress.set_style(progress_style());
    let mut totals = LossTotals::default();

    for batch_idx in 1..=batches_per_epoch {
        let batch = stream.next_batch(rng, device)?;
        let pred = net.forward(&batch.inputs)?;
        let loss = compute_loss(&pred, &batch.position, &batch.cos, &batch.sin, &batch.width)?;
        let loss_value = totals.add(&loss)?;

        if batch_idx % LOG_EVERY_BATCHES == 0 {
            info!("Epoch: {epoch}, Batch: {batch_idx}, Loss: {loss_value:0.4}");
        }

        optimizer.backward_step(&loss.total)?;

        if let (Some(vis_dir), 1) = (vis_dir, batch_idx) {
            write_visualisation(
                &vis_dir.join(format!("epoch_{epoch:02}.png")),
                &batch,
                &pred,
            )?;
        }

        progress.set_message(format!("loss={loss_value:.4}"));
        progress.inc(1);
    }
    progress.finish_and_clear();

    let totals = totals.mean();
    Ok(TrainResults {
        loss: totals.loss,
        losses: totals.losses,
    })
}

/// Evaluates `val_batches` single-item batches, counting an item as
/// correct when its best detected grasp matches the ground truth.
pub fn validate(
    net: &dyn GraspNet,
    device: &Device,
    loader: &GraspLoader,
    val_batches: usize,
    rng: &mut StdRng,
) -> anyhow::Result<ValidationResults> {
    let mut totals = LossTotals::default();
    let mut correct = 0usize;
    let mut failed = 0usize;

    if loader.is_empty() || val_batches == 0 {
        let totals = totals.mean();
        return Ok(ValidationResults {
            loss: totals.loss,
            losses: totals.losses,
            correct,
            failed,
        });
    }

    let size = loader.dataset().cfg.output_size;
    let progress = ProgressBar::new(val_batches as u64);
    progress.set_style(progress_style());
    let mut stream = BatchStream::new(loader);

    for _ in 0..val_batches {
        let batch = stream.next_batch(rng, device)?;
        let pred = net.forward(&batch.inputs)?;
        let loss = compute_loss(&pred, &batch.position, &batch.cos, &batch.sin, &batch.width)?;
        totals.add(&loss)?;

        for (i, meta) in batch.samples.iter().enumerate() {
            let output = post_process_output(
                &item_map(&pred.position, i)?,
                &item_map(&pred.cos, i)?,
                &item_map(&pred.sin, i)?,
                &item_map(&pred.width, i)?,
                (size, size),
            );
            let ground_truth = loader
                .dataset()
                .ground_truth(meta.index, meta.rot, meta.zoom)?;
            if calculate_iou_match(&output, &ground_truth, 1) {
                correct += 1;
            } else {
                failed += 1;
            }
        }
        progress.set_message(format!("correct={correct} failed={failed}"));
        progress.inc(1);
    }
    progress.finish_and_clear();

    let totals = totals.mean();
    Ok(ValidationResults {
        loss: totals.loss,
        losses: totals.losses,
        correct,
        failed,
    })
}

fn write_visualisation(
    path: &Path,
    batch: &Batch,
    pred: &GraspPrediction,
) -> anyhow::Result<()> {
    let (_, channels, h, w) = batch.inputs.dims4()?;
    let input = item_map(&batch.inputs, 0)?;
    let target = [
        item_map(&batch.position, 0)?,
        item_map(&batch.cos, 0)?,
        item_map(&batch.sin, 0)?,
        item_map(&batch.width, 0)?,
    ];
    let predicted = [
        item_map(&pred.position, 0)?,
        item_map(&pred.cos, 0)?,
        item_map(&pred.sin, 0)?,
        item_map(&pred.width, 0)?,
    ];
    save_preview_montage(
        path,
        &input,
        channels,
        &MapSet {
            position: &target[0],
            cos: &target[1],
            sin: &target[2],
            width: &target[3],
        },
        &MapSet {
            position: &predicted[0],
            cos: &predicted[1],
            sin: &predicted[2],
            width: &predicted[3],
        },
        h,
        w,
    )
}

/// Item `i` of a batched tensor as a flat host vector.
fn item_map(t: &Tensor, i: usize) -> anyhow::Result<Vec<f32>> {
    Ok(t
        .get(i)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?)
}

fn resolve_device(device_arg: &str) -> anyhow::Result<Device> {
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => {
            let device = Device::new_cuda(0)
                .context("CUDA requested with --device cuda, but CUDA is not available")?;
            Ok(device)
        }
        other => anyhow::bail!("Unsupported --device value: {other} (expected auto|cpu|cuda)"),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

trait ExpandHome {
    fn expand_home(&self) -> PathBuf;
}

impl ExpandHome for PathBuf {
    fn expand_home(&self) -> PathBuf {
        let path_str = self.to_string_lossy();
        if !path_str.starts_with('~') {
            return self.clone();
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        if path_str == "~" {
            return PathBuf::from(home);
        }

        if let Some(stripped) = path_str.strip_prefix("~/") {
            return PathBuf::from(home).join(stripped);
        }

        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array2;

    fn write_jacquard_dataset(root: &Path, objects: usize) {
        for i in 0..objects {
            let dir = root.join("objects").join(format!("obj_{i}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{i}_o_grasps.txt")), "512;480;10;300;80\n").unwrap();
            let depth = Array2::from_shape_fn((48, 48), |(r, c)| ((r + c) as f32) / 96.0);
            ndarray_npy::write_npy(dir.join(format!("{i}_o_perfect_depth.npy")), &depth).unwrap();
            let rgb: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_pixel(48, 48, Rgb([100, 120, 140]));
            rgb.save(dir.join(format!("{i}_o_RGB.png"))).unwrap();
        }
    }

    fn test_config(dataset_path: &Path, output_dir: &Path, extra: &[&str]) -> TrainConfig {
        let dataset_path = dataset_path.to_string_lossy().to_string();
        let output_dir = output_dir.to_string_lossy().to_string();
        let mut argv = vec![
            "ggcnn-trainer",
            "--dataset",
            "jacquard",
            "--dataset-path",
            &dataset_path,
            "--output-dir",
            &output_dir,
            "--output-size",
            "48",
            "--batch-size",
            "2",
            "--epochs",
            "2",
            "--batches-per-epoch",
            "2",
            "--val-batches",
            "2",
            "--num-workers",
            "2",
            "--split",
            "0.75",
            "--device",
            "cpu",
        ];
        argv.extend_from_slice(extra);
        TrainConfig::parse_from(argv)
    }

    #[test]
    fn prepare_run_dirs_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let save_dir = dir.path().join("run");
        fs::create_dir_all(&save_dir).unwrap();
        fs::write(save_dir.join("stale.txt"), "old").unwrap();

        let log_dir = prepare_run_dirs(&save_dir).unwrap();
        assert!(log_dir.is_dir());
        assert!(!save_dir.join("stale.txt").exists());
    }

    #[test]
    fn loss_totals_average_over_batches() {
        let one = Tensor::new(1.0f32, &Device::Cpu).unwrap();
        let three = Tensor::new(3.0f32, &Device::Cpu).unwrap();
        let mut totals = LossTotals::default();
        totals
            .add(&GraspLoss {
                total: one.clone(),
                heads: [one.clone(), one.clone(), one.clone(), one.clone()],
            })
            .unwrap();
        totals
            .add(&GraspLoss {
                total: three.clone(),
                heads: [three.clone(), one.clone(), one.clone(), one],
            })
            .unwrap();
        let mean = totals.mean();
        assert!((mean.loss - 2.0).abs() < 1e-9);
        assert_eq!(mean.losses[0].0, "p_loss");
        assert!((mean.losses[0].1 - 2.0).abs() < 1e-9);
        assert!((mean.losses[1].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn end_to_end_run_writes_artifacts() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_jacquard_dataset(data.path(), 4);
        let cfg = test_config(data.path(), out.path(), &["--vis", "--use-rgb", "1"]);
        cfg.validate().unwrap();

        let save_dir = out.path().join("run");
        let log_dir = prepare_run_dirs(&save_dir).unwrap();
        run(&cfg, DatasetKind::Jacquard, data.path(), &save_dir, &log_dir).unwrap();

        assert!(save_dir.join("arch.txt").exists());
        assert!(save_dir.join("config.json").exists());
        assert!(save_dir.join("metrics_history.json").exists());
        assert!(save_dir.join("vis").join("epoch_00.png").exists());

        // Epoch 0 is always checkpointed.
        let first: Vec<_> = fs::read_dir(&save_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("epoch_00_iou_"))
            .collect();
        assert_eq!(first.len(), 2, "{first:?}");

        let events = crate::summary::read_scalars(&log_dir.join(crate::summary::SCALARS_FILE))
            .unwrap();
        let tags: Vec<&str> = events.iter().map(|e| e.tag.as_str()).collect();
        assert!(tags.contains(&"loss/train_loss"));
        assert!(tags.contains(&"train_loss/p_loss"));
        assert!(tags.contains(&"loss/IOU"));
        assert!(tags.contains(&"val_loss/width_loss"));
        assert_eq!(
            events.iter().filter(|e| e.tag == "loss/IOU").count(),
            2
        );
    }

    #[test]
    fn sweep_trains_each_subdirectory() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_jacquard_dataset(&data.path().join("gmd"), 4);
        let mut cfg = test_config(data.path(), out.path(), &[]);
        cfg.epochs = 1;
        cfg.dataset = None;
        cfg.sweep = vec!["gmd".to_string()];
        cfg.validate().unwrap();

        run_sweep(&cfg).unwrap();
        let run_dir = out.path().join("gmd");
        assert!(run_dir.join("logs").join(crate::summary::SCALARS_FILE).exists());
        assert!(run_dir.join("arch.txt").exists());
    }
}
