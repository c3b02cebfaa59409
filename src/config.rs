use clap::{Parser, ValueEnum};
use serde::Serialize;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Ggcnn,
    Ggcnn2,
}

impl NetworkKind {
    pub fn name(self) -> &'static str {
        match self {
            NetworkKind::Ggcnn => "ggcnn",
            NetworkKind::Ggcnn2 => "ggcnn2",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cornell,
    Jacquard,
}

impl DatasetKind {
    /// Maps a sweep directory name to the file layout it uses. Custom
    /// datasets are generated in the Jacquard layout.
    pub fn from_alias(alias: &str) -> Self {
        match alias.to_ascii_lowercase().as_str() {
            "cor" | "cornell" => DatasetKind::Cornell,
            _ => DatasetKind::Jacquard,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            DatasetKind::Cornell => "Cornell",
            DatasetKind::Jacquard => "Jacquard",
        }
    }
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "ggcnn-trainer",
    about = "Train a GG-CNN grasp prediction network using Candle"
)]
pub struct TrainConfig {
    #[arg(long, value_enum, default_value_t = NetworkKind::Ggcnn, help = "Network architecture")]
    pub network: NetworkKind,

    #[arg(long, value_enum, help = "Dataset layout (cornell or jacquard)")]
    pub dataset: Option<DatasetKind>,

    #[arg(long, default_value = "", help = "Path to dataset")]
    pub dataset_path: String,

    #[arg(long, default_value_t = 1, help = "Use depth image for training (1/0)")]
    pub use_depth: u8,

    #[arg(long, default_value_t = 0, help = "Use RGB image for training (0/1)")]
    pub use_rgb: u8,

    #[arg(
        long,
        default_value_t = 0.9,
        help = "Fraction of data for training (remainder is validation)"
    )]
    pub split: f64,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Shift the start point of the dataset to use a different test/train split"
    )]
    pub ds_rotate: f64,

    #[arg(long, default_value_t = 8, help = "Dataset workers")]
    pub num_workers: usize,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1000)]
    pub batches_per_epoch: usize,

    #[arg(long, default_value_t = 250)]
    pub val_batches: usize,

    #[arg(long, default_value = "", help = "Training description")]
    pub description: String,

    #[arg(long, default_value_t = false, help = "Write visualisations of the training process")]
    pub vis: bool,

    #[arg(long, default_value = "./output/models")]
    pub output_dir: String,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 300)]
    pub output_size: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value = "auto")]
    pub device: String,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Train each listed subdirectory of --dataset-path in turn (e.g. gmd,cor,jaq)"
    )]
    pub sweep: Vec<String>,
}

impl TrainConfig {
    pub fn include_depth(&self) -> bool {
        self.use_depth != 0
    }

    pub fn include_rgb(&self) -> bool {
        self.use_rgb != 0
    }

    pub fn input_channels(&self) -> usize {
        usize::from(self.include_depth()) + 3 * usize::from(self.include_rgb())
    }

    pub fn is_sweep(&self) -> bool {
        !self.sweep.is_empty()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.split > 0.0 && self.split <= 1.0) {
            anyhow::bail!("--split must be in (0, 1], got {}", self.split);
        }
        if !(0.0..1.0).contains(&self.ds_rotate) {
            anyhow::bail!("--ds-rotate must be in [0, 1), got {}", self.ds_rotate);
        }
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be > 0");
        }
        if self.batches_per_epoch == 0 {
            anyhow::bail!("--batches-per-epoch must be > 0");
        }
        if self.output_size == 0 {
            anyhow::bail!("--output-size must be > 0");
        }
        if self.input_channels() == 0 {
            anyhow::bail!("At least one of --use-depth and --use-rgb must be enabled");
        }
        if self.dataset_path.is_empty() {
            anyhow::bail!("--dataset-path is required");
        }
        if !self.is_sweep() && self.dataset.is_none() {
            anyhow::bail!("--dataset is required unless --sweep is given");
        }
        Ok(())
    }

    /// Folder name for a single run: the explicit run name, or a timestamp
    /// followed by the description words joined with underscores.
    pub fn run_id(&self, timestamp: &str) -> String {
        if let Some(name) = &self.run_name {
            return name.clone();
        }
        let description: Vec<&str> = self.description.split_whitespace().collect();
        if description.is_empty() {
            timestamp.to_string()
        } else {
            format!("{timestamp}_{}", description.join("_"))
        }
    }
}
