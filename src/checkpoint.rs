use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;
use log::warn;
use serde::Serialize;

use crate::config::NetworkKind;

/// Fraction of validation items with a matching grasp. An empty validation
/// pass yields zero.
pub fn iou_from_counts(correct: usize, failed: usize) -> f64 {
    let total = correct + failed;
    if total == 0 {
        warn!("Validation produced no results; reporting IOU as 0");
        return 0.0;
    }
    correct as f64 / total as f64
}

/// Decides which epochs are written to disk. An epoch is saved when it
/// beats the running best, is the first epoch, or is a multiple of ten.
/// Every save resets the running best to the saved IOU.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPolicy {
    best_iou: f64,
}

impl CheckpointPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_iou(&self) -> f64 {
        self.best_iou
    }

    pub fn should_save(&self, epoch: usize, iou: f64) -> bool {
        iou > self.best_iou || epoch == 0 || epoch % 10 == 0
    }

    /// Returns whether the epoch should be saved, updating the running best
    /// when it is.
    pub fn observe(&mut self, epoch: usize, iou: f64) -> bool {
        let save = self.should_save(epoch, iou);
        if save {
            self.best_iou = iou;
        }
        save
    }
}

/// Everything needed to rebuild the network from its weights file.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCheckpoint {
    pub network: NetworkKind,
    pub input_channels: usize,
    pub output_size: usize,
    pub epoch: usize,
    pub iou: f64,
    pub weights: String,
}

#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub model_path: PathBuf,
    pub weights_path: PathBuf,
}

pub fn checkpoint_stem(epoch: usize, iou: f64) -> String {
    format!("epoch_{epoch:02}_iou_{iou:.2}")
}

/// Writes `<stem>.json` describing the model and `<stem>_statedict.safetensors`
/// holding its weights.
pub fn save_checkpoint(
    save_dir: &Path,
    varmap: &VarMap,
    network: NetworkKind,
    input_channels: usize,
    output_size: usize,
    epoch: usize,
    iou: f64,
) -> anyhow::Result<SavedCheckpoint> {
    let stem = checkpoint_stem(epoch, iou);
    let weights_name = format!("{stem}_statedict.safetensors");
    let weights_path = save_dir.join(&weights_name);
    varmap
        .save(&weights_path)
        .with_context(|| format!("Failed writing checkpoint: {}", weights_path.display()))?;

    let model = ModelCheckpoint {
        network,
        input_channels,
        output_size,
        epoch,
        iou,
        weights: weights_name,
    };
    let model_path = save_dir.join(format!("{stem}.json"));
    fs::write(&model_path, serde_json::to_string_pretty(&model)?).with_context(|| {
        format!(
            "Failed writing checkpoint metadata: {}",
            model_path.display()
        )
    })?;

    Ok(SavedCheckpoint {
        model_path,
        weights_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn iou_handles_empty_validation() {
        assert_eq!(iou_from_counts(0, 0), 0.0);
        assert!((iou_from_counts(3, 1) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn first_and_tenth_epochs_are_always_saved() {
        let mut policy = CheckpointPolicy::new();
        assert!(policy.observe(0, 0.0));
        assert!(!policy.observe(1, 0.0));
        assert!(policy.observe(2, 0.4));
        assert!(!policy.observe(3, 0.4));
        assert!(!policy.observe(4, 0.3));
        assert!(policy.observe(10, 0.1));
        // Saving on a tenth epoch lowers the bar for the next one.
        assert_eq!(policy.best_iou(), 0.1);
        assert!(policy.observe(11, 0.2));
    }

    #[test]
    fn stems_are_zero_padded() {
        assert_eq!(checkpoint_stem(3, 0.756), "epoch_03_iou_0.76");
        assert_eq!(checkpoint_stem(120, 1.0), "epoch_120_iou_1.00");
    }

    #[test]
    fn save_writes_weights_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = vb.get((2, 2), "w").unwrap();

        let saved =
            save_checkpoint(dir.path(), &varmap, NetworkKind::Ggcnn, 1, 300, 0, 0.5).unwrap();
        assert!(saved.weights_path.ends_with("epoch_00_iou_0.50_statedict.safetensors"));
        assert!(saved.weights_path.exists());

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&saved.model_path).unwrap()).unwrap();
        assert_eq!(meta["network"], "ggcnn");
        assert_eq!(meta["weights"], "epoch_00_iou_0.50_statedict.safetensors");
    }
}
