//! Input and output collaborators of the pipeline

use crate::booster::GradientBoostingClassifier;
use crate::error::SegmentationError;
use crate::pipeline::{ControlFile, PipelineOutput};
use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PROFILE_TABLE: &str = "df_cluster_rfm";
pub const IMPORTANCE_TABLE: &str = "df_cluster_importance";
pub const SEGMENTER_MODEL: &str = "kmeans_segmenter";
pub const SCALER_MODEL: &str = "segmenter_scaler";
pub const INTERPRETER_MODEL: &str = "lgbm_interpreter";
pub const CONTROL_FILE: &str = "control_file";

/// Where transactions and a previously trained interpreter come from
pub trait TransactionSource {
    fn load_transactions(&self) -> crate::Result<DataFrame>;

    /// Latest persisted interpreter, if any
    fn load_interpreter(&self) -> crate::Result<Option<GradientBoostingClassifier>>;
}

/// Where a finished run is written
pub trait OutputSink {
    fn write(&mut self, output: &PipelineOutput) -> crate::Result<()>;
}

/// A store that is both source and sink
pub trait Store: TransactionSource + OutputSink {}

impl<T: TransactionSource + OutputSink> Store for T {}

/// Storage backend, resolved once at start-up.
///
/// Remote database or object-store backends plug in by implementing
/// [`TransactionSource`] and [`OutputSink`] directly.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Transactions file plus an output directory
    Local { input: PathBuf, root: PathBuf },
    /// Everything in memory
    Memory(MemoryStore),
}

impl Backend {
    pub fn open(self) -> crate::Result<Box<dyn Store>> {
        match self {
            Backend::Local { input, root } => {
                let store = LocalStore::new(input, root);
                store.ensure_layout()?;
                Ok(Box::new(store))
            }
            Backend::Memory(store) => Ok(Box::new(store)),
        }
    }
}

/// Filesystem layout: `data/` parquet tables, `model/` versioned JSON models,
/// `artifact/` the control file
#[derive(Debug, Clone)]
pub struct LocalStore {
    input: PathBuf,
    root: PathBuf,
}

impl LocalStore {
    pub fn new(input: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    fn artifact_dir(&self) -> PathBuf {
        self.root.join("artifact")
    }

    pub fn ensure_layout(&self) -> crate::Result<()> {
        for dir in [self.data_dir(), self.model_dir(), self.artifact_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.data_dir().join(format!("{}.parquet", name))
    }

    pub fn model_path(&self, name: &str, version: u32) -> PathBuf {
        self.model_dir().join(format!("{}_v{}.json", name, version))
    }

    pub fn control_file_path(&self) -> PathBuf {
        self.artifact_dir().join(format!("{}.json", CONTROL_FILE))
    }

    /// Highest version of `name` in the model directory
    pub fn latest_version(&self, name: &str) -> crate::Result<Option<u32>> {
        let dir = self.model_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let prefix = format!("{}_v", name);
        let mut latest = None;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let version = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| stem.strip_prefix(&prefix))
                .and_then(|v| v.parse::<u32>().ok());
            if let Some(v) = version {
                latest = latest.max(Some(v));
            }
        }
        Ok(latest)
    }

    /// Write `value` as the next version of `name`
    pub fn write_model<T: Serialize>(&self, name: &str, value: &T) -> crate::Result<u32> {
        let version = self.latest_version(name)?.map_or(1, |v| v + 1);
        let path = self.model_path(name, version);
        let file = File::create(&path)?;
        serde_json::to_writer(file, value)?;
        info!("Exported model to {}", path.display());
        Ok(version)
    }

    pub fn read_model<T: DeserializeOwned>(&self, name: &str, version: u32) -> crate::Result<T> {
        let file = File::open(self.model_path(name, version))?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn write_table(&self, name: &str, df: &mut DataFrame) -> crate::Result<()> {
        let path = self.table_path(name);
        let file = File::create(&path)?;
        ParquetWriter::new(file).finish(df)?;
        info!("Exported data to {}", path.display());
        Ok(())
    }

    pub fn read_table(&self, name: &str) -> crate::Result<DataFrame> {
        let file = File::open(self.table_path(name))?;
        Ok(ParquetReader::new(file).finish()?)
    }

    pub fn read_control_file(&self) -> crate::Result<ControlFile> {
        let file = File::open(self.control_file_path())?;
        Ok(serde_json::from_reader(file)?)
    }
}

impl TransactionSource for LocalStore {
    fn load_transactions(&self) -> crate::Result<DataFrame> {
        let extension = self
            .input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        info!("Reading transactions from {}", self.input.display());

        let df = match extension.as_deref() {
            Some("csv") => LazyCsvReader::new(&self.input)
                .with_has_header(true)
                .finish()?
                .collect()?,
            Some("parquet") => {
                LazyFrame::scan_parquet(&self.input, ScanArgsParquet::default())?.collect()?
            }
            _ => {
                return Err(SegmentationError::Config(format!(
                    "unsupported input file {}, expected .csv or .parquet",
                    self.input.display()
                )))
            }
        };
        debug!("Read {} transaction rows", df.height());
        Ok(df)
    }

    fn load_interpreter(&self) -> crate::Result<Option<GradientBoostingClassifier>> {
        match self.latest_version(INTERPRETER_MODEL)? {
            Some(version) => {
                info!("Loading {}_v{}", INTERPRETER_MODEL, version);
                self.read_model(INTERPRETER_MODEL, version).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl OutputSink for LocalStore {
    fn write(&mut self, output: &PipelineOutput) -> crate::Result<()> {
        self.ensure_layout()?;

        self.write_table(PROFILE_TABLE, &mut output.profile_frame()?)?;
        self.write_table(IMPORTANCE_TABLE, &mut output.importance_frame()?)?;

        self.write_model(SEGMENTER_MODEL, &output.cluster_model)?;
        self.write_model(SCALER_MODEL, &output.scaler)?;

        let mut control = output.control_file();
        let interpreter_version = if output.is_train_interpreter {
            let version = self.write_model(INTERPRETER_MODEL, &output.classifier)?;
            control.eval_metrics.interpreter_train_date = Some(control.eval_metrics.date);
            Some(version)
        } else {
            self.latest_version(INTERPRETER_MODEL)?
        };
        control.eval_metrics.interpreter_model = Some(INTERPRETER_MODEL.to_string());
        control.eval_metrics.interpreter_model_version = interpreter_version;

        let path = self.control_file_path();
        serde_json::to_writer_pretty(File::create(&path)?, &control)?;
        info!("Exported control file to {}", path.display());
        Ok(())
    }
}

/// In-memory store; written runs are kept in order
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub transactions: DataFrame,
    pub interpreter: Option<GradientBoostingClassifier>,
    pub outputs: Vec<PipelineOutput>,
}

impl MemoryStore {
    pub fn new(transactions: DataFrame) -> Self {
        Self {
            transactions,
            interpreter: None,
            outputs: Vec::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DataFrame::empty())
    }
}

impl TransactionSource for MemoryStore {
    fn load_transactions(&self) -> crate::Result<DataFrame> {
        Ok(self.transactions.clone())
    }

    fn load_interpreter(&self) -> crate::Result<Option<GradientBoostingClassifier>> {
        Ok(self.interpreter.clone())
    }
}

impl OutputSink for MemoryStore {
    fn write(&mut self, output: &PipelineOutput) -> crate::Result<()> {
        if output.is_train_interpreter {
            self.interpreter = Some(output.classifier.clone());
        }
        self.outputs.push(output.clone());
        Ok(())
    }
}
