//! The epoch loop: one training pass and one validation pass per epoch.
//!
//! A [`TrainingSession`] owns everything the loop mutates: the model, the
//! optimizer, the best validation top-1 seen so far and the mixup RNG.

use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use colored::Colorize;
use finetune_core::{accuracy, mixup_top1, AverageMeter, Phase, Result};
use finetune_data::{mixup_batch, EpochLoader, ImageBatcher};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::checkpoint::{decode_optimizer, encode_module, encode_optimizer, Checkpoint, CheckpointManager};
use crate::lr_schedule::LearningRateScheduler;
use crate::model::{conv_layer_index, Vgg};
use crate::summary::{acc_tag, loss_tag, ScalarSink};

/// Epoch averages of one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
}

/// Everything a session needs besides the model and optimizer
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model_name: String,
    pub dataset_name: String,
    pub num_classes: usize,
    pub image_size: usize,
    pub scheduler: LearningRateScheduler,
    /// Mixup alpha, when mixup is enabled
    pub mixup_alpha: Option<f64>,
    /// Conv layers whose channel sparsity is logged after training epochs
    pub prune_layers: Vec<String>,
    pub seed: u64,
}

struct EpochMeters {
    losses: AverageMeter,
    top1: AverageMeter,
    top5: AverageMeter,
    batch_time: AverageMeter,
}

impl EpochMeters {
    fn new() -> Self {
        Self {
            losses: AverageMeter::new(),
            top1: AverageMeter::new(),
            top5: AverageMeter::new(),
            batch_time: AverageMeter::new(),
        }
    }

    fn message(&self) -> String {
        format!(
            "Loss: {:.3} | Acc1: {:.3}% | Acc5: {:.3}%",
            self.losses.avg, self.top1.avg, self.top5.avg
        )
    }

    fn stats(&self) -> EpochStats {
        EpochStats {
            loss: self.losses.avg,
            top1: self.top1.avg,
            top5: self.top5.avg,
        }
    }
}

fn progress_bar(len: usize, phase: Phase) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix:>5} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_prefix(phase.to_string());
    bar
}

/// Cross-entropy of a mixed batch: `lam * L(logits, a) + (1 - lam) * L(logits, b)`.
pub fn mixup_criterion<B: Backend>(
    criterion: &CrossEntropyLoss<B>,
    logits: Tensor<B, 2>,
    targets_a: Tensor<B, 1, Int>,
    targets_b: Tensor<B, 1, Int>,
    lam: f64,
) -> Tensor<B, 1> {
    let loss_a = criterion.forward(logits.clone(), targets_a);
    let loss_b = criterion.forward(logits, targets_b);
    loss_a.mul_scalar(lam) + loss_b.mul_scalar(1.0 - lam)
}

fn host_logits<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<f32>> {
    logits
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| finetune_core::Error::Training(format!("Failed to read logits: {e:?}")))
}

fn host_targets<B: Backend>(targets: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    targets
        .into_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|e| finetune_core::Error::Training(format!("Failed to read targets: {e:?}")))
}

pub struct TrainingSession<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Vgg<B>, B>,
{
    model: Vgg<B>,
    optimizer: O,
    config: SessionConfig,
    device: B::Device,
    criterion: CrossEntropyLoss<B>,
    prune_layers: Vec<(String, usize)>,
    best_acc: f64,
    rng: ChaCha8Rng,
}

impl<B, O> TrainingSession<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Vgg<B>, B>,
{
    /// Creates a session; unknown prune layer names are rejected here.
    pub fn new(model: Vgg<B>, optimizer: O, config: SessionConfig, device: B::Device) -> Result<Self> {
        let prune_layers = config
            .prune_layers
            .iter()
            .map(|name| conv_layer_index(name).map(|index| (name.clone(), index)))
            .collect::<Result<Vec<_>>>()?;
        let criterion = CrossEntropyLossConfig::new().init(&device);
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Ok(Self {
            model,
            optimizer,
            config,
            device,
            criterion,
            prune_layers,
            best_acc: 0.0,
            rng,
        })
    }

    pub fn model(&self) -> &Vgg<B> {
        &self.model
    }

    pub fn best_acc(&self) -> f64 {
        self.best_acc
    }

    /// Restores best accuracy and optimizer state from a checkpoint and
    /// returns the epoch to continue from.
    pub fn restore(mut self, checkpoint: &Checkpoint) -> Result<(Self, usize)> {
        self.best_acc = checkpoint.best_acc;
        if let Some(bytes) = &checkpoint.optimizer {
            self.optimizer = decode_optimizer::<B, Vgg<B>, O>(self.optimizer, bytes, &self.device)?;
        }
        let start_epoch = checkpoint.epoch + 1;
        info!(
            "=> Restored state of epoch {} (best acc {:.3}%), continuing at epoch {}",
            checkpoint.epoch, self.best_acc, start_epoch
        );
        Ok((self, start_epoch))
    }

    /// Learning rate for `epoch`, logged once per epoch.
    pub fn adjust_learning_rate(&self, epoch: usize) -> f64 {
        let lr = self.config.scheduler.lr_at(epoch);
        info!("=> lr: {}", lr);
        lr
    }

    /// One optimisation pass over `loader`.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        loader: &EpochLoader,
        sink: &mut dyn ScalarSink,
    ) -> Result<EpochStats> {
        println!("\n{}", format!("Epoch: {epoch}").yellow().bold());
        let lr = self.adjust_learning_rate(epoch);

        let batcher = ImageBatcher::<B>::new(self.device.clone(), self.config.image_size);
        let num_classes = self.config.num_classes;
        let mut meters = EpochMeters::new();
        let bar = progress_bar(loader.num_batches(), Phase::Train);
        let mut end = Instant::now();

        for items in loader.iter(epoch) {
            let batch = batcher.batch(items?);
            let n = batch.len();
            let targets = host_targets(batch.targets.clone())?;

            let (logits, loss, mixed) = match self.config.mixup_alpha {
                None => {
                    let logits = self.model.forward(batch.images);
                    let loss = self.criterion.forward(logits.clone(), batch.targets);
                    (logits, loss, None)
                }
                Some(alpha) => {
                    let mixed = mixup_batch(batch.images, batch.targets, alpha, &mut self.rng)?;
                    let logits = self.model.forward(mixed.images);
                    let loss = mixup_criterion(
                        &self.criterion,
                        logits.clone(),
                        mixed.targets_a,
                        mixed.targets_b.clone(),
                        mixed.lam,
                    );
                    (logits, loss, Some((host_targets(mixed.targets_b)?, mixed.lam)))
                }
            };

            let loss_value: f64 = loss.clone().into_scalar().elem();
            let scores = host_logits(logits)?;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(lr, self.model.clone(), grads);

            let acc = accuracy(&scores, num_classes, &targets, &[1, 5]);
            let top1 = match &mixed {
                None => acc[0],
                Some((targets_b, lam)) => mixup_top1(&scores, num_classes, &targets, targets_b, *lam),
            };
            meters.losses.update(loss_value, n);
            meters.top1.update(top1, n);
            meters.top5.update(acc[1], n);
            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            bar.set_message(meters.message());
            bar.inc(1);
        }
        bar.finish();
        debug!("Average batch time: {:.3}s", meters.batch_time.avg);

        let stats = meters.stats();
        sink.add_scalar(&loss_tag(Phase::Train), stats.loss, epoch)?;
        sink.add_scalar(&acc_tag(Phase::Train, 1), stats.top1, epoch)?;
        sink.add_scalar(&acc_tag(Phase::Train, 5), stats.top5, epoch)?;

        for (name, index) in &self.prune_layers {
            if let Some(fraction) = self.model.channel_sparsity(*index) {
                info!("{}: {:.2}% output channels zeroed", name, fraction * 100.0);
            }
        }

        Ok(stats)
    }

    /// One evaluation pass over `loader`.
    ///
    /// With `save` set the epoch is recorded: scalars go to the sink, the
    /// best accuracy is updated and a checkpoint is written.
    pub fn test_epoch(
        &mut self,
        epoch: usize,
        loader: &EpochLoader,
        save: Option<(&mut dyn ScalarSink, &CheckpointManager)>,
    ) -> Result<EpochStats> {
        let model = self.model.valid();
        let batcher = ImageBatcher::<B::InnerBackend>::new(self.device.clone(), self.config.image_size);
        let criterion: CrossEntropyLoss<B::InnerBackend> = CrossEntropyLossConfig::new().init(&self.device);
        let num_classes = self.config.num_classes;
        let mut meters = EpochMeters::new();
        let bar = progress_bar(loader.num_batches(), Phase::Test);
        let mut end = Instant::now();

        for items in loader.iter(epoch) {
            let batch = batcher.batch(items?);
            let n = batch.len();
            let targets = host_targets(batch.targets.clone())?;

            let logits = model.forward(batch.images);
            let loss = criterion.forward(logits.clone(), batch.targets);
            let loss_value: f64 = loss.into_scalar().elem();
            let scores = host_logits(logits)?;

            let acc = accuracy(&scores, num_classes, &targets, &[1, 5]);
            meters.losses.update(loss_value, n);
            meters.top1.update(acc[0], n);
            meters.top5.update(acc[1], n);
            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            bar.set_message(meters.message());
            bar.inc(1);
        }
        bar.finish();

        let stats = meters.stats();
        if let Some((sink, checkpoints)) = save {
            sink.add_scalar(&loss_tag(Phase::Test), stats.loss, epoch)?;
            sink.add_scalar(&acc_tag(Phase::Test, 1), stats.top1, epoch)?;
            sink.add_scalar(&acc_tag(Phase::Test, 5), stats.top5, epoch)?;

            let is_best = stats.top1 > self.best_acc;
            if is_best {
                self.best_acc = stats.top1;
            }
            println!("Current best acc: {}", self.best_acc);

            let checkpoint = Checkpoint::new(
                epoch,
                self.config.model_name.as_str(),
                self.config.dataset_name.as_str(),
                stats.top1,
                self.best_acc,
                encode_module(&self.model)?,
            )
            .with_optimizer(encode_optimizer::<B, Vgg<B>, O>(&self.optimizer)?);
            checkpoints.save(&checkpoint, is_best)?;
        }

        Ok(stats)
    }

    /// Trains for `n_epoch` epochs starting at `start_epoch`, validating
    /// and checkpointing after each one. Returns the best top-1.
    pub fn fit(
        &mut self,
        start_epoch: usize,
        n_epoch: usize,
        train: &EpochLoader,
        val: &EpochLoader,
        sink: &mut dyn ScalarSink,
        checkpoints: &CheckpointManager,
    ) -> Result<f64> {
        for epoch in start_epoch..start_epoch + n_epoch {
            let train_stats = self.train_epoch(epoch, train, sink)?;
            let test_stats = self.test_epoch(epoch, val, Some((&mut *sink, checkpoints)))?;

            let marker = if test_stats.top1 >= self.best_acc {
                " (best)".green().to_string()
            } else {
                String::new()
            };
            println!(
                "  {} Loss: {:.4} | Train Acc: {:.2}% | Val Acc: {:.2}%{}",
                "→".cyan(),
                train_stats.loss,
                train_stats.top1,
                test_stats.top1,
                marker
            );
        }
        Ok(self.best_acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VggPlan, VGG16_CONV_LAYERS};
    use crate::summary::MemorySink;
    use burn::backend::Autodiff;
    use burn::optim::SgdConfig;
    use burn_ndarray::NdArray;
    use finetune_core::LrPolicy;
    use finetune_data::{worker_pool, ImageArray, ImageDataset, Transform};
    use std::sync::Arc;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn loaders() -> (EpochLoader, EpochLoader) {
        let len = 8;
        let data = (0..len * 32 * 32 * 3).map(|i| (i * 7 % 256) as u8).collect();
        let images = ImageArray::new(data, len, 32, 32).unwrap();
        let labels = (0..len as i64).map(|i| i % 3).collect();
        let dataset = Arc::new(ImageDataset::new(images, labels, 3).unwrap());
        let pool = worker_pool(2).unwrap();
        let train = EpochLoader::new(dataset.clone(), Transform::Train { size: 32 }, 4, true, 0, pool.clone());
        let val = EpochLoader::new(dataset, Transform::Eval { size: 32 }, 4, false, 0, pool);
        (train, val)
    }

    fn config(mixup_alpha: Option<f64>, prune_layers: Vec<String>) -> SessionConfig {
        SessionConfig {
            model_name: "vgg16_bn_x".to_string(),
            dataset_name: "cifar10".to_string(),
            num_classes: 3,
            image_size: 32,
            scheduler: LearningRateScheduler::new(LrPolicy::Fixed, 0.01, 2),
            mixup_alpha,
            prune_layers,
            seed: 0,
        }
    }

    fn session(
        config: SessionConfig,
    ) -> Result<TrainingSession<TestBackend, impl Optimizer<Vgg<TestBackend>, TestBackend>>> {
        let device = Default::default();
        let plan = VggPlan { widths: vec![2; VGG16_CONV_LAYERS] };
        let model = Vgg::<TestBackend>::new(&plan, 3, &device);
        let optimizer = SgdConfig::new().init::<TestBackend, Vgg<TestBackend>>();
        TrainingSession::new(model, optimizer, config, device)
    }

    #[test]
    fn test_train_epoch_records_scalars() -> Result<()> {
        let (train, _) = loaders();
        let mut session = session(config(None, vec!["conv0".to_string()]))?;
        let mut sink = MemorySink::default();

        let stats = session.train_epoch(3, &train, &mut sink)?;
        assert!(stats.loss.is_finite());
        assert!((0.0..=100.0).contains(&stats.top1));
        assert_eq!(stats.top5, 100.0);

        let tags: Vec<&str> = sink.events.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(tags, vec!["loss/train", "acc/train_top1", "acc/train_top5"]);
        assert!(sink.events.iter().all(|(_, _, step)| *step == 3));
        Ok(())
    }

    #[test]
    fn test_train_epoch_with_mixup() -> Result<()> {
        let (train, _) = loaders();
        let mut session = session(config(Some(0.4), Vec::new()))?;
        let stats = session.train_epoch(0, &train, &mut MemorySink::default())?;
        assert!(stats.loss.is_finite());
        assert!((0.0..=100.0).contains(&stats.top1));
        Ok(())
    }

    fn cross_entropy(row: &[f64], target: usize) -> f64 {
        let lse = row.iter().map(|v| v.exp()).sum::<f64>().ln();
        lse - row[target]
    }

    #[test]
    fn test_mixup_criterion_blends_losses() {
        type Inner = NdArray<f32>;
        let device = Default::default();
        let criterion: CrossEntropyLoss<Inner> = CrossEntropyLossConfig::new().init(&device);
        let rows = [[1.0, 2.0, 3.0], [0.5, 0.0, -0.5]];
        let logits = || {
            Tensor::<Inner, 2>::from_floats(
                TensorData::new(rows.iter().flatten().map(|v| *v as f32).collect::<Vec<_>>(), [2, 3]),
                &device,
            )
        };
        let targets = |t: [i64; 2]| Tensor::<Inner, 1, Int>::from_data(TensorData::new(t.to_vec(), [2]), &device);

        let loss_a = (cross_entropy(&rows[0], 2) + cross_entropy(&rows[1], 0)) / 2.0;
        let loss_b = (cross_entropy(&rows[0], 0) + cross_entropy(&rows[1], 1)) / 2.0;

        let lam = 0.25;
        let mixed: f64 = mixup_criterion(&criterion, logits(), targets([2, 0]), targets([0, 1]), lam)
            .into_scalar()
            .elem();
        assert!((mixed - (lam * loss_a + (1.0 - lam) * loss_b)).abs() < 1e-5);

        // lam = 1 is the plain loss on the original targets
        let plain: f64 = criterion.forward(logits(), targets([2, 0])).into_scalar().elem();
        let unmixed: f64 = mixup_criterion(&criterion, logits(), targets([2, 0]), targets([0, 1]), 1.0)
            .into_scalar()
            .elem();
        assert!((plain - loss_a).abs() < 1e-5);
        assert!((unmixed - plain).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_prune_layer_rejected() {
        let result = session(config(None, vec!["fc".to_string()]));
        assert!(matches!(result, Err(finetune_core::Error::InvalidArgument(_))));
    }

    #[test]
    fn test_eval_without_save_writes_nothing() -> Result<()> {
        let (_, val) = loaders();
        let mut session = session(config(None, Vec::new()))?;
        let stats = session.test_epoch(0, &val, None)?;
        assert!(stats.loss.is_finite());
        assert_eq!(session.best_acc(), 0.0);
        Ok(())
    }

    #[test]
    fn test_saved_epochs_track_best() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoints = CheckpointManager::new(dir.path().to_path_buf());
        let (train, val) = loaders();
        let mut session = session(config(None, Vec::new()))?;
        let mut sink = MemorySink::default();

        let best = session.fit(0, 2, &train, &val, &mut sink, &checkpoints)?;
        assert_eq!(best, session.best_acc());

        let saved = Checkpoint::load(&checkpoints.latest_path())?;
        assert_eq!(saved.epoch, 1);
        assert_eq!(saved.best_acc, best);
        assert!(saved.optimizer.is_some());

        let test_top1: Vec<f64> = sink
            .events
            .iter()
            .filter(|(tag, _, _)| tag == "acc/test_top1")
            .map(|(_, v, _)| *v)
            .collect();
        assert_eq!(test_top1.len(), 2);
        assert_eq!(best, test_top1.iter().cloned().fold(0.0, f64::max));
        if best > 0.0 {
            assert!(checkpoints.best_path().exists());
        }
        Ok(())
    }

    #[test]
    fn test_restore_continues_after_checkpoint() -> Result<()> {
        let session = session(config(None, Vec::new()))?;
        let checkpoint = Checkpoint::new(6, "vgg16_bn_x", "cifar10", 40.0, 55.0, Vec::new());
        let (session, start) = session.restore(&checkpoint)?;
        assert_eq!(start, 7);
        assert_eq!(session.best_acc(), 55.0);
        Ok(())
    }
}
