pub mod backbone;
pub mod data;
pub mod ml_model;
pub mod training;
pub mod inference;

pub use backbone::{load_backbone, VggBackbone, VggBackboneConfig};
pub use data::{BatchStream, ClassLabels, DatasetSplits, ImageBatch, ImageFolderDataset};
pub use ml_model::{assemble_model, load_and_normalize_image_with_size, ClassificationHead, ParameterSummary, TransferModel};
pub use training::{run_training, train, Checkpointer, EpochMetrics, TrainingHistory, TrainingOutcome, TrainingState};
pub use inference::{InferenceEngine, Prediction};
