//! Checkpoint files of a fine-tune run.
//!
//! A checkpoint is a single file: a bincode envelope holding run metadata
//! and the model (and optionally optimizer) state as burn binary records.
//! After every validation epoch it is written to `ckpt.pth.tar` in the run
//! folder and copied to `ckpt.best.pth.tar` when top-1 improved.
//!
//! Resuming also accepts a bare model record, as produced by
//! [`encode_module`], so weights exported elsewhere can be fine-tuned.

use std::fs;
use std::path::{Path, PathBuf};

use bincode::Options;
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use chrono::Utc;
use finetune_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CHECKPOINT_FILE: &str = "ckpt.pth.tar";
pub const BEST_CHECKPOINT_FILE: &str = "ckpt.best.pth.tar";

const FORMAT_TAG: &str = "finetune-ckpt/1";

type BytesRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Serialises a module's parameters and buffers.
pub fn encode_module<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<u8>> {
    let recorder = BytesRecorder::default();
    Recorder::<B>::record(&recorder, module.clone().into_record(), ())
        .map_err(|e| Error::Checkpoint(format!("Failed to encode model: {e:?}")))
}

/// Collects the shape of every tensor a module holds, in visit order.
#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D, Int>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

fn tensor_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector::default();
    module.visit(&mut collector);
    collector.shapes
}

/// Loads serialised parameters into `module`.
///
/// Every loaded tensor must have the shape the module was built with;
/// weights of another channel plan or class count are rejected.
pub fn decode_module<B: Backend, M: Module<B>>(module: M, bytes: &[u8], device: &B::Device) -> Result<M> {
    let recorder = BytesRecorder::default();
    let record: M::Record = Recorder::<B>::load(&recorder, bytes.to_vec(), device)
        .map_err(|e| Error::Checkpoint(format!("Failed to decode model: {e:?}")))?;

    let expected = tensor_shapes::<B, M>(&module);
    let module = module.load_record(record);
    let found = tensor_shapes::<B, M>(&module);

    if expected.len() != found.len() {
        return Err(Error::Checkpoint(format!(
            "checkpoint holds {} tensors, model expects {}",
            found.len(),
            expected.len()
        )));
    }
    if let Some((i, (want, got))) = expected
        .iter()
        .zip(&found)
        .enumerate()
        .find(|(_, (want, got))| want != got)
    {
        return Err(Error::Checkpoint(format!(
            "size mismatch for tensor {i}: checkpoint has {got:?}, model expects {want:?}"
        )));
    }
    Ok(module)
}

pub fn encode_optimizer<B, M, O>(optimizer: &O) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let recorder = BytesRecorder::default();
    Recorder::<B>::record(&recorder, optimizer.to_record(), ())
        .map_err(|e| Error::Checkpoint(format!("Failed to encode optimizer: {e:?}")))
}

pub fn decode_optimizer<B, M, O>(optimizer: O, bytes: &[u8], device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let recorder = BytesRecorder::default();
    let record: O::Record = Recorder::<B>::load(&recorder, bytes.to_vec(), device)
        .map_err(|e| Error::Checkpoint(format!("Failed to decode optimizer: {e:?}")))?;
    Ok(optimizer.load_record(record))
}

/// Model state and bookkeeping saved after a validation epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    format: String,
    pub epoch: usize,
    pub model: String,
    pub dataset: String,
    /// Top-1 of the epoch that wrote this checkpoint
    pub acc: f64,
    /// Best top-1 seen so far, including this epoch
    pub best_acc: f64,
    pub timestamp: String,
    pub state_dict: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        model: impl Into<String>,
        dataset: impl Into<String>,
        acc: f64,
        best_acc: f64,
        state_dict: Vec<u8>,
    ) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            epoch,
            model: model.into(),
            dataset: dataset.into(),
            acc,
            best_acc,
            timestamp: Utc::now().to_rfc3339(),
            state_dict,
            optimizer: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Vec<u8>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    fn codec(limit: usize) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(limit as u64)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {e}")))
    }

    /// Parses an envelope; fails on anything not written by [`Checkpoint::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let checkpoint: Checkpoint = Self::codec(bytes.len())
            .deserialize(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {e}")))?;
        if checkpoint.format != FORMAT_TAG {
            return Err(Error::Checkpoint(format!(
                "unknown checkpoint format '{}'",
                checkpoint.format
            )));
        }
        Ok(checkpoint)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Fails unless this checkpoint was written for `model` on `dataset`.
    pub fn ensure_matches(&self, model: &str, dataset: &str) -> Result<()> {
        if self.model != model || self.dataset != dataset {
            return Err(Error::Checkpoint(format!(
                "checkpoint is for {} on {}, run is {} on {}",
                self.model, self.dataset, model, dataset
            )));
        }
        Ok(())
    }
}

/// What a resume path turned out to hold
#[derive(Debug, Clone)]
pub enum ResumeSource {
    /// A full checkpoint written by a previous run
    Wrapped(Checkpoint),
    /// A bare model record
    Weights(Vec<u8>),
}

impl ResumeSource {
    /// Reads a resume file. A missing file is an error; content that is
    /// not an envelope is assumed to be a bare model record.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            Error::Checkpoint(format!("Failed to read checkpoint {}: {e}", path.display()))
        })?;
        Ok(match Checkpoint::from_bytes(&bytes) {
            Ok(checkpoint) => ResumeSource::Wrapped(checkpoint),
            Err(_) => ResumeSource::Weights(bytes),
        })
    }

    pub fn state_dict(&self) -> &[u8] {
        match self {
            ResumeSource::Wrapped(checkpoint) => &checkpoint.state_dict,
            ResumeSource::Weights(bytes) => bytes,
        }
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            ResumeSource::Wrapped(checkpoint) => Some(checkpoint),
            ResumeSource::Weights(_) => None,
        }
    }
}

/// Writes checkpoints into one run folder
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: PathBuf) -> Self {
        Self { checkpoint_dir }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.checkpoint_dir.join(CHECKPOINT_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join(BEST_CHECKPOINT_FILE)
    }

    /// Overwrites the latest checkpoint and, if `is_best`, the best one.
    pub fn save(&self, checkpoint: &Checkpoint, is_best: bool) -> Result<()> {
        let path = self.latest_path();
        info!("=> Saving checkpoint to {}", path.display());
        checkpoint.save(&path)?;

        if is_best {
            fs::copy(&path, self.best_path())?;
        }
        Ok(())
    }
}
