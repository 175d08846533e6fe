//! End-to-end fine-tune and evaluation runs.

use std::path::PathBuf;
use std::sync::Arc;

use burn::optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use finetune_core::{select_device, LassoPruneConfig, Result, RunConfig};
use finetune_data::{worker_pool, DataSplit, EpochLoader, ImageDataset, Transform};
use tracing::{info, warn};

use crate::backend::{backend_device, backend_name, TrainBackend, GPU_BACKEND};
use crate::checkpoint::{decode_module, CheckpointManager, ResumeSource};
use crate::lr_schedule::LearningRateScheduler;
use crate::model::{Vgg, VggPlan};
use crate::profile::ModelProfile;
use crate::run_dir::get_output_folder;
use crate::session::{EpochStats, SessionConfig, TrainingSession};
use crate::summary::SummaryWriter;

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub profile: ModelProfile,
    /// Best validation top-1 (the only top-1 for evaluation runs)
    pub best_acc: f64,
    /// Stats of an evaluation-only run
    pub eval: Option<EpochStats>,
    /// Run folder of a training run
    pub log_dir: Option<PathBuf>,
}

/// Runs on the backend this binary was built with.
pub fn run(config: &RunConfig, prune: Option<&LassoPruneConfig>) -> Result<RunSummary> {
    let device = select_device(config.n_gpu, GPU_BACKEND);
    info!("Using device: {} ({})", device, backend_name());
    run_on::<TrainBackend>(config, prune, backend_device(device))
}

pub fn run_on<B: AutodiffBackend>(
    config: &RunConfig,
    prune: Option<&LassoPruneConfig>,
    device: B::Device,
) -> Result<RunSummary> {
    config.validate()?;
    let arch = config.model_arch()?;
    let dataset = config.dataset_kind()?;
    let lr_policy = config.lr_policy()?;
    let num_classes = dataset.num_classes();
    let image_size = dataset.image_size();

    let prune_policy = match prune {
        Some(prune) => {
            if prune.model != config.model {
                warn!(
                    "Prune config was written for {}, fine-tuning {}",
                    prune.model, config.model
                );
            }
            prune.policy()?
        }
        None => None,
    };

    let seed = match config.seed {
        Some(seed) => {
            B::seed(seed);
            seed
        }
        None => rand::random(),
    };

    println!("{}", "=> Preparing data..".cyan());
    let pool = worker_pool(config.n_worker)?;
    let val_data = ImageDataset::load(&config.data_root, DataSplit::Val, num_classes)?;
    let val = EpochLoader::new(
        Arc::new(val_data),
        Transform::Eval { size: image_size as u32 },
        config.batch_size,
        false,
        seed,
        pool.clone(),
    );
    let train = if config.eval {
        None
    } else {
        let train_data = ImageDataset::load(&config.data_root, DataSplit::Train, num_classes)?;
        Some(EpochLoader::new(
            Arc::new(train_data),
            Transform::Train { size: image_size as u32 },
            config.batch_size,
            true,
            seed,
            pool,
        ))
    };

    println!("{}", "=> Building model..".cyan());
    let plan = VggPlan::for_arch(arch, prune_policy)?;
    let model = Vgg::<B>::new(&plan, num_classes, &device);
    let profile = ModelProfile::measure(&model, &plan, image_size);
    info!(
        "=> Model Parameter: {:.3} M, FLOPs: {:.3}M",
        profile.params_millions(),
        profile.flops_millions()
    );

    let ckpt_path = config
        .ckpt_path
        .clone()
        .or_else(|| prune.map(|prune| prune.ckpt.clone()));
    let mut resumed = None;
    let model = match &ckpt_path {
        Some(path) => {
            info!("=> Resuming from checkpoint {}", path.display());
            let source = ResumeSource::read(path)?;
            if let Some(checkpoint) = source.checkpoint() {
                checkpoint.ensure_matches(&config.model, &config.dataset)?;
            }
            let model = decode_module(model, source.state_dict(), &device)?;
            resumed = source.checkpoint().cloned();
            model
        }
        None => model,
    };

    info!("Using SGD...");
    info!("weight decay  = {}", config.wd);
    let optimizer = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(config.wd as f32)))
        .init::<B, Vgg<B>>();

    let session_config = SessionConfig {
        model_name: config.model.clone(),
        dataset_name: config.dataset.clone(),
        num_classes,
        image_size,
        scheduler: LearningRateScheduler::new(lr_policy, config.lr, config.n_epoch),
        mixup_alpha: config.mixup.then_some(config.mixup_alpha),
        prune_layers: config.prune_layer.clone().unwrap_or_default(),
        seed,
    };
    let mut session = TrainingSession::new(model, optimizer, session_config, device)?;

    let Some(train) = train else {
        println!("{}", "=> Start evaluation...".green().bold());
        let stats = session.test_epoch(0, &val, None)?;
        println!(
            "Loss: {:.3} | Acc1: {:.3}% | Acc5: {:.3}%",
            stats.loss, stats.top1, stats.top5
        );
        return Ok(RunSummary {
            profile,
            best_acc: stats.top1,
            eval: Some(stats),
            log_dir: None,
        });
    };

    println!("{}", "=> Start training...".green().bold());
    println!("Training {} on {}...", config.model, config.dataset);

    let mut start_epoch = 0;
    if config.resume_state {
        match &resumed {
            Some(checkpoint) => {
                let (restored, epoch) = session.restore(checkpoint)?;
                session = restored;
                start_epoch = epoch;
            }
            None => warn!("Resume file holds weights only; starting from epoch 0"),
        }
    }

    let log_dir = get_output_folder(&config.log_root, &config.run_name())?;
    println!("=> Saving logs to {}", log_dir.display());
    let mut writer = SummaryWriter::new(&log_dir)?;
    let checkpoints = CheckpointManager::new(log_dir.clone());

    let best_acc = session.fit(
        start_epoch,
        config.n_epoch,
        &train,
        &val,
        &mut writer,
        &checkpoints,
    )?;
    writer.close()?;

    println!(
        "{}",
        format!(
            "=> Model Parameter: {:.3} M, FLOPs: {:.3}M, best top-1 acc: {}%",
            profile.params_millions(),
            profile.flops_millions(),
            best_acc
        )
        .green()
        .bold()
    );

    Ok(RunSummary {
        profile,
        best_acc,
        eval: None,
        log_dir: Some(log_dir),
    })
}

