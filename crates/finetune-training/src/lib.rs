//! Models, scheduling, checkpointing and the epoch loop.
//!
//! This crate provides:
//! - VGG-16-BN at full and pruned width, with FLOP profiling
//! - Learning rate policies
//! - Single-file checkpoints and numbered run folders
//! - The training session and the end-to-end run driver

pub mod backend;
pub mod checkpoint;
pub mod lr_schedule;
pub mod model;
pub mod pipeline;
pub mod profile;
pub mod run_dir;
pub mod session;
pub mod summary;

pub use backend::{backend_device, backend_name, InnerBackend, TrainBackend, GPU_BACKEND};
pub use checkpoint::{
    decode_module, encode_module, Checkpoint, CheckpointManager, ResumeSource, BEST_CHECKPOINT_FILE,
    CHECKPOINT_FILE,
};
pub use lr_schedule::LearningRateScheduler;
pub use model::{conv_layer_index, conv_layer_name, Vgg, VggPlan};
pub use pipeline::{run, run_on, RunSummary};
pub use profile::{count_flops, ModelProfile};
pub use run_dir::get_output_folder;
pub use session::{mixup_criterion, EpochStats, SessionConfig, TrainingSession};
pub use summary::{MemorySink, ScalarEvent, ScalarSink, SummaryWriter, METRICS_FILE, SCALARS_FILE};
