//! Fine-tune CLI
//!
//! Recovers the accuracy of a pruned image classifier, or evaluates a
//! checkpoint on the validation split.
//!
//! Usage:
//!   finetune --model vgg16_bn_x --dataset cifar10 --data_root data --ckpt_path pruned.bin
//!   finetune --config run.toml --prune_config lasso.toml --n_epoch 30
//!   finetune --dataset cifar10 --ckpt_path logs/vgg16_bn_cifar10_finetune-run1/ckpt.best.pth.tar --eval

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::info;

use finetune_core::{load_toml_config, setup_cli_logging, LassoPruneConfig, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "finetune")]
#[command(about = "Fine-tune or evaluate a pruned image classifier")]
#[command(long_about = "Runs SGD fine-tuning of a (pruned) VGG16-BN on safetensors image arrays,
with per-epoch validation, checkpointing of the best top-1 and scalar logs
written to <log_root>/<model>_<dataset>_finetune-run<N>.")]
struct Args {
    /// Run configuration file (TOML); flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Lasso pruning configuration (TOML) supplying the checkpoint and channel policy
    #[arg(long = "prune_config", value_name = "FILE")]
    prune_config: Option<PathBuf>,

    /// Model architecture (vgg16_bn, vgg16_bn_x)
    #[arg(long)]
    model: Option<String>,

    /// Dataset (imagenet, cifar10, cifar100)
    #[arg(long)]
    dataset: Option<String>,

    /// Base learning rate
    #[arg(long, value_name = "LR")]
    lr: Option<f64>,

    /// Number of GPUs to use
    #[arg(long = "n_gpu")]
    n_gpu: Option<usize>,

    /// Batch size
    #[arg(long = "batch_size", value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Number of preprocessing workers
    #[arg(long = "n_worker")]
    n_worker: Option<usize>,

    /// Learning rate policy (cos, exp, fixed)
    #[arg(long = "lr_type")]
    lr_type: Option<String>,

    /// Number of epochs
    #[arg(long = "n_epoch")]
    n_epoch: Option<usize>,

    /// Weight decay
    #[arg(long)]
    wd: Option<f64>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Directory holding the safetensors arrays
    #[arg(long = "data_root", value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Checkpoint to load weights from
    #[arg(long = "ckpt_path", value_name = "FILE")]
    ckpt_path: Option<PathBuf>,

    /// Evaluate only
    #[arg(long)]
    eval: bool,

    /// Train with mixup
    #[arg(long)]
    mixup: bool,

    /// Beta distribution parameter for mixup
    #[arg(long = "mixup_alpha")]
    mixup_alpha: Option<f64>,

    /// Conv layers whose channel sparsity is logged after each epoch
    #[arg(long = "prune_layer", num_args = 1..)]
    prune_layer: Option<Vec<String>>,

    /// Parent directory for run folders
    #[arg(long = "log_root", value_name = "DIR")]
    log_root: Option<PathBuf>,

    /// Also restore epoch, best accuracy and optimizer state from the checkpoint
    #[arg(long = "resume_state")]
    resume_state: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("Pruned Network Fine-tuning");
    info!("==========================");

    let mut config = match &args.config {
        Some(path) => load_toml_config::<RunConfig>(path)
            .with_context(|| format!("Failed to load run configuration {}", path.display()))?,
        None => RunConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid run configuration")?;

    let prune = args
        .prune_config
        .as_ref()
        .map(|path| {
            load_toml_config::<LassoPruneConfig>(path)
                .with_context(|| format!("Failed to load prune configuration {}", path.display()))
        })
        .transpose()?;

    print_config_summary(&config, prune.as_ref());

    let summary = finetune_training::run(&config, prune.as_ref())
        .with_context(|| format!("Run {} failed", config.run_name()))?;

    match (&summary.eval, &summary.log_dir) {
        (Some(stats), _) => println!(
            "{} loss {:.4} | top1 {:.3} | top5 {:.3}",
            "Evaluation:".green().bold(),
            stats.loss,
            stats.top1,
            stats.top5
        ),
        (None, Some(dir)) => println!(
            "{} {}",
            "Logs and checkpoints in".green().bold(),
            dir.display()
        ),
        (None, None) => {}
    }

    Ok(())
}

fn apply_overrides(config: &mut RunConfig, args: &Args) {
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(dataset) = &args.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(lr) = args.lr {
        config.lr = lr;
    }
    if let Some(n_gpu) = args.n_gpu {
        config.n_gpu = n_gpu;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(n_worker) = args.n_worker {
        config.n_worker = n_worker;
    }
    if let Some(lr_type) = &args.lr_type {
        config.lr_type = lr_type.clone();
    }
    if let Some(n_epoch) = args.n_epoch {
        config.n_epoch = n_epoch;
    }
    if let Some(wd) = args.wd {
        config.wd = wd;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(data_root) = &args.data_root {
        config.data_root = data_root.clone();
    }
    if args.ckpt_path.is_some() {
        config.ckpt_path = args.ckpt_path.clone();
    }
    if let Some(mixup_alpha) = args.mixup_alpha {
        config.mixup_alpha = mixup_alpha;
    }
    if args.prune_layer.is_some() {
        config.prune_layer = args.prune_layer.clone();
    }
    if let Some(log_root) = &args.log_root {
        config.log_root = log_root.clone();
    }
    // Switches can only turn a file setting on.
    config.eval |= args.eval;
    config.mixup |= args.mixup;
    config.resume_state |= args.resume_state;
}

fn print_config_summary(config: &RunConfig, prune: Option<&LassoPruneConfig>) {
    info!("");
    info!("Configuration Summary:");
    info!("  Model: {}", config.model);
    info!("  Dataset: {}", config.dataset);
    info!("  Mode: {}", if config.eval { "eval" } else { "finetune" });
    info!("  Epochs: {}", config.n_epoch);
    info!("  Batch size: {}", config.batch_size);
    info!("  Learning rate: {} ({})", config.lr, config.lr_type);
    info!("  Weight decay: {}", config.wd);
    info!("  Momentum: {}", config.momentum);
    info!("  Workers: {}", config.n_worker);
    if config.mixup {
        info!("  Mixup alpha: {}", config.mixup_alpha);
    }
    info!("  Data root: {}", config.data_root.display());
    if let Some(ckpt) = &config.ckpt_path {
        info!("  Checkpoint: {}", ckpt.display());
    }
    if let Some(prune) = prune {
        info!("  Pruner: {} ({})", prune.pruner, prune.model);
    }
    info!("  Log root: {}", config.log_root.display());
    info!("");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underscore_flags() {
        let args = Args::parse_from([
            "finetune",
            "--model",
            "vgg16_bn_x",
            "--batch_size",
            "32",
            "--lr_type",
            "cos",
            "--n_epoch",
            "3",
            "--prune_layer",
            "conv0",
            "conv3",
            "--mixup",
        ]);
        let mut config = RunConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.model, "vgg16_bn_x");
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.lr_type, "cos");
        assert_eq!(config.n_epoch, 3);
        assert_eq!(
            config.prune_layer,
            Some(vec!["conv0".to_string(), "conv3".to_string()])
        );
        assert!(config.mixup);
        assert!(!config.eval);
    }

    #[test]
    fn test_overrides_keep_file_values() {
        let args = Args::parse_from(["finetune", "--lr", "0.01"]);
        let mut config = RunConfig {
            dataset: "cifar100".to_string(),
            mixup: true,
            ..RunConfig::default()
        };
        apply_overrides(&mut config, &args);

        assert_eq!(config.lr, 0.01);
        assert_eq!(config.dataset, "cifar100");
        assert!(config.mixup);
    }
}
