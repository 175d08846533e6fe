//! End-to-end runs on a tiny synthetic CIFAR-shaped dataset.

use std::fs;
use std::path::Path;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use finetune_core::{Error, LassoPruneConfig, Result, RunConfig};
use finetune_data::{save_images, save_labels, DataSplit, ImageArray};
use finetune_training::{
    encode_module, run_on, Checkpoint, Vgg, VggPlan, BEST_CHECKPOINT_FILE, CHECKPOINT_FILE,
    METRICS_FILE, SCALARS_FILE,
};

type TestBackend = Autodiff<NdArray<f32>>;

const POLICY: [f64; 13] = [0.05; 13];

fn write_split(root: &Path, split: DataSplit, len: usize, offset: usize) -> Result<()> {
    let data = (0..len * 32 * 32 * 3)
        .map(|i| ((i + offset) * 31 % 256) as u8)
        .collect();
    let images = ImageArray::new(data, len, 32, 32)?;
    let labels: Vec<i64> = (0..len as i64).map(|i| i % 10).collect();
    save_images(&split.images_path(root), &images)?;
    save_labels(&split.labels_path(root), &labels)
}

fn prune_config(dir: &Path) -> Result<LassoPruneConfig> {
    // Pruned weights as a bare model record, the way a pruner exports them.
    let plan = VggPlan::from_policy(&POLICY)?;
    let model = Vgg::<TestBackend>::new(&plan, 10, &Default::default());
    let ckpt = dir.join("pruned.bin");
    fs::write(&ckpt, encode_module(&model)?)?;

    Ok(LassoPruneConfig::new("vgg16_bn_x", ckpt, dir.join("data")).with_policy(POLICY.to_vec()))
}

fn base_config(dir: &Path) -> RunConfig {
    RunConfig {
        model: "vgg16_bn_x".to_string(),
        dataset: "cifar10".to_string(),
        lr: 0.01,
        batch_size: 4,
        n_worker: 2,
        lr_type: "cos".to_string(),
        n_epoch: 2,
        seed: Some(1),
        data_root: dir.join("data"),
        mixup: true,
        prune_layer: Some(vec!["conv0".to_string(), "conv12".to_string()]),
        log_root: dir.join("logs"),
        ..RunConfig::default()
    }
}

#[test]
fn test_train_eval_and_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data_root = dir.path().join("data");
    fs::create_dir_all(&data_root)?;
    write_split(&data_root, DataSplit::Train, 12, 0)?;
    write_split(&data_root, DataSplit::Val, 6, 7)?;
    let prune = prune_config(dir.path())?;

    // Training run, weights from the prune config.
    let config = base_config(dir.path());
    let summary = run_on::<TestBackend>(&config, Some(&prune), Default::default())?;
    let log_dir = summary.log_dir.clone().expect("training run has a log dir");
    assert_eq!(log_dir, dir.path().join("logs/vgg16_bn_x_cifar10_finetune-run1"));
    assert!(summary.profile.params > 0);
    assert!((0.0..=100.0).contains(&summary.best_acc));

    let latest = Checkpoint::load(&log_dir.join(CHECKPOINT_FILE))?;
    assert_eq!(latest.epoch, 1);
    assert_eq!(latest.model, "vgg16_bn_x");
    assert_eq!(latest.dataset, "cifar10");
    assert_eq!(latest.best_acc, summary.best_acc);
    if summary.best_acc > 0.0 {
        assert!(log_dir.join(BEST_CHECKPOINT_FILE).exists());
    }

    let scalars = fs::read_to_string(log_dir.join(SCALARS_FILE))?;
    assert_eq!(scalars.lines().count(), 12);
    let csv = fs::read_to_string(log_dir.join(METRICS_FILE))?;
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.starts_with("epoch,acc/test_top1,acc/test_top5,acc/train_top1"));

    // Evaluation only: no new run folder.
    let eval_config = RunConfig {
        eval: true,
        ckpt_path: Some(log_dir.join(CHECKPOINT_FILE)),
        ..base_config(dir.path())
    };
    let eval = run_on::<TestBackend>(&eval_config, Some(&prune), Default::default())?;
    let stats = eval.eval.expect("evaluation stats");
    assert!(stats.loss.is_finite());
    assert_eq!(stats.top1, latest.acc);
    assert!(eval.log_dir.is_none());
    assert!(!dir.path().join("logs/vgg16_bn_x_cifar10_finetune-run2").exists());

    // Resume with state: continues numbering of epochs in a new run folder.
    let resume_config = RunConfig {
        n_epoch: 1,
        mixup: false,
        resume_state: true,
        ckpt_path: Some(log_dir.join(CHECKPOINT_FILE)),
        ..base_config(dir.path())
    };
    let resumed = run_on::<TestBackend>(&resume_config, Some(&prune), Default::default())?;
    let resumed_dir = resumed.log_dir.expect("training run has a log dir");
    assert_eq!(resumed_dir, dir.path().join("logs/vgg16_bn_x_cifar10_finetune-run2"));
    assert_eq!(Checkpoint::load(&resumed_dir.join(CHECKPOINT_FILE))?.epoch, 2);
    assert!(resumed.best_acc >= summary.best_acc);
    Ok(())
}

#[test]
fn test_checkpoint_for_other_dataset_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data_root = dir.path().join("data");
    fs::create_dir_all(&data_root)?;
    write_split(&data_root, DataSplit::Val, 4, 0)?;

    let plan = VggPlan::from_policy(&POLICY)?;
    let model = Vgg::<TestBackend>::new(&plan, 10, &Default::default());
    let ckpt = dir.path().join(CHECKPOINT_FILE);
    Checkpoint::new(3, "vgg16_bn_x", "cifar100", 50.0, 50.0, encode_module(&model)?).save(&ckpt)?;

    let config = RunConfig {
        eval: true,
        ckpt_path: Some(ckpt),
        ..base_config(dir.path())
    };
    let prune = LassoPruneConfig::new("vgg16_bn_x", dir.path().join("unused.bin"), &data_root)
        .with_policy(POLICY.to_vec());
    let result = run_on::<TestBackend>(&config, Some(&prune), Default::default());
    assert!(matches!(result, Err(Error::Checkpoint(_))));
    Ok(())
}

#[test]
fn test_weights_of_other_plan_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data_root = dir.path().join("data");
    fs::create_dir_all(&data_root)?;
    write_split(&data_root, DataSplit::Val, 4, 0)?;

    // Weights of another channel plan offered to vgg16_bn_x.
    let model = Vgg::<TestBackend>::new(&VggPlan { widths: vec![8; 13] }, 10, &Default::default());
    let ckpt = dir.path().join("weights.bin");
    fs::write(&ckpt, encode_module(&model)?)?;

    let config = RunConfig {
        eval: true,
        ckpt_path: Some(ckpt),
        ..base_config(dir.path())
    };
    let result = run_on::<TestBackend>(&config, None, Default::default());
    assert!(matches!(result, Err(Error::Checkpoint(_))));
    Ok(())
}

#[test]
fn test_unsupported_policy_fails_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        lr_type: "step3".to_string(),
        data_root: dir.path().join("missing"),
        ..RunConfig::default()
    };
    let result = run_on::<TestBackend>(&config, None, Default::default());
    assert!(matches!(result, Err(Error::UnsupportedPolicy(_))));
}

#[test]
fn test_missing_data_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        dataset: "cifar10".to_string(),
        data_root: dir.path().join("missing"),
        ..RunConfig::default()
    };
    let result = run_on::<TestBackend>(&config, None, Default::default());
    assert!(matches!(result, Err(Error::Dataset(_))));
}
