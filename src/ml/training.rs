//! モデル学習とチェックポイント保存
//!
//! 特徴抽出器を固定したまま分類ヘッドのみをRMSpropで更新し、
//! エポックの終わりごとに学習対象パラメータを同じファイルへ上書き保存します。

use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer, RmsPropConfig},
    record::{BinBytesRecorder, DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::ml::backbone::load_backbone;
use crate::ml::data::{BatchStream, ClassLabels, DatasetSplits};
use crate::ml::ml_model::{assemble_model, BinaryClassificationOutput, TransferModel};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata, TrainingSettings};

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    /// モデル組み立て直後（まだ1ステップも実行していない）
    Assembled,
    /// エポック内でパラメータ更新中
    Training,
    /// エポック終了時のチェックポイント保存済み
    Checkpointed,
}

impl TrainingState {
    /// 学習ステップの開始
    pub fn begin_step(self) -> Self {
        TrainingState::Training
    }

    /// エポック終了（チェックポイント保存後）
    pub fn end_epoch(self) -> Self {
        match self {
            TrainingState::Training => TrainingState::Checkpointed,
            other => other,
        }
    }
}

/// 1エポック分の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    pub train_steps: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_steps: usize,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    /// このエポックで書き込んだチェックポイント
    pub checkpoint: PathBuf,
}

/// 学習履歴
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// チェックポイントの書き込み回数
    pub checkpoint_writes: usize,
    pub state: TrainingState,
}

impl Default for TrainingHistory {
    fn default() -> Self {
        Self {
            epochs: Vec::new(),
            checkpoint_writes: 0,
            state: TrainingState::Assembled,
        }
    }
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// JSONとして保存
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// 損失と正解数の集計
#[derive(Debug, Default)]
struct EpochMeter {
    loss_sum: f64,
    steps: usize,
    correct: usize,
    seen: usize,
}

impl EpochMeter {
    fn update<B: Backend>(&mut self, output: &BinaryClassificationOutput<B>) -> f64 {
        let loss = output.loss_value();
        self.loss_sum += loss;
        self.steps += 1;
        self.correct += output.num_correct();
        self.seen += output.batch_size();
        loss
    }

    fn mean_loss(&self) -> f64 {
        if self.steps > 0 {
            self.loss_sum / self.steps as f64
        } else {
            0.0
        }
    }

    fn accuracy(&self) -> f64 {
        if self.seen > 0 {
            self.correct as f64 / self.seen as f64
        } else {
            0.0
        }
    }
}

/// チェックポイントの保存・復元
///
/// 保存先は常に `<dir>/ckpt_training_<tag>.mpk` の1ファイルで、保存のたびに上書きされる。
/// 特徴抽出器を固定している場合は分類ヘッドのパラメータのみを保存する。
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    tag: String,
}

impl Checkpointer {
    /// 保存先ディレクトリを作成してチェックポイント管理を開始
    pub fn new<P: AsRef<Path>>(dir: P, tag: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| TransferError::Checkpoint {
            path: dir.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            dir,
            tag: tag.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 拡張子なしのパス（レコーダーに渡す）
    pub fn base_path(&self) -> PathBuf {
        self.dir.join(format!("ckpt_training_{}", self.tag))
    }

    /// 実際に書き込まれるファイル
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("ckpt_training_{}.mpk", self.tag))
    }

    fn error(&self, e: impl std::fmt::Debug) -> TransferError {
        TransferError::Checkpoint {
            path: self.file_path(),
            message: format!("{:?}", e),
        }
    }

    /// 学習対象のパラメータを保存
    pub fn save<B: Backend>(&self, model: &TransferModel<B>) -> Result<PathBuf> {
        // DefaultFileRecorderを使用してf32精度で保存
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        if model.is_backbone_frozen() {
            model
                .head()
                .clone()
                .save_file(self.base_path(), &recorder)
                .map_err(|e| self.error(e))?;
        } else {
            model
                .clone()
                .save_file(self.base_path(), &recorder)
                .map_err(|e| self.error(e))?;
        }

        debug!("チェックポイントを保存しました: {}", self.file_path().display());
        Ok(self.file_path())
    }

    /// 保存済みのパラメータをモデルに読み込む
    pub fn load<B: Backend>(
        &self,
        model: TransferModel<B>,
        device: &B::Device,
    ) -> Result<TransferModel<B>> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        if model.is_backbone_frozen() {
            let head = model
                .head()
                .clone()
                .load_file(self.base_path(), &recorder, device)
                .map_err(|e| self.error(e))?;
            Ok(model.with_head(head))
        } else {
            model
                .load_file(self.base_path(), &recorder, device)
                .map_err(|e| self.error(e))
        }
    }
}

/// 学習ループ
///
/// 各エポックで `train_len / batch_size` 回の更新と `valid_len / batch_size` 回の検証を行い、
/// エポック終了時にチェックポイントを1回上書き保存する。
///
/// # 引数
/// - `model`: 組み立て済みのモデル
/// - `train_stream`: 学習用バッチ列（Autodiffバックエンド）
/// - `valid_stream`: 検証用バッチ列（内部バックエンド）
/// - `settings`: エポック数・学習率
/// - `checkpointer`: チェックポイント保存先
pub fn train<B: AutodiffBackend>(
    model: TransferModel<B>,
    train_stream: &mut BatchStream<B>,
    valid_stream: &mut BatchStream<B::InnerBackend>,
    settings: &TrainingSettings,
    checkpointer: &Checkpointer,
) -> Result<(TransferModel<B>, TrainingHistory)> {
    if settings.num_epochs == 0 {
        return Err(TransferError::config("エポック数は1以上である必要があります"));
    }

    let mut model = model;
    let mut optimizer = RmsPropConfig::new()
        .with_alpha(0.9)
        .with_epsilon(1e-7)
        .init::<B, TransferModel<B>>();
    let mut history = TrainingHistory::default();

    let train_steps = train_stream.steps_per_epoch();
    let valid_steps = valid_stream.steps_per_epoch();

    info!(
        "学習を開始します: エポック数 {}, 学習ステップ {}/epoch, 検証ステップ {}/epoch, 学習率 {}",
        settings.num_epochs, train_steps, valid_steps, settings.learning_rate
    );

    for epoch in 1..=settings.num_epochs {
        info!("Epoch {}/{}", epoch, settings.num_epochs);

        // 学習フェーズ
        train_stream.start_pass();
        let mut train_meter = EpochMeter::default();
        for step in 0..train_steps {
            let batch = train_stream.next_batch()?;
            history.state = history.state.begin_step();

            let output = model.forward_classification(batch.images, batch.targets);
            let loss = train_meter.update(&output);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(settings.learning_rate, model, grads);

            if (step + 1) % 10 == 0 || step + 1 == train_steps {
                debug!(
                    "  Step {:>4}/{}: loss = {:.4}, acc = {:.2}%",
                    step + 1,
                    train_steps,
                    loss,
                    train_meter.accuracy() * 100.0
                );
            }
        }

        // 検証フェーズ（内部バックエンドで順伝播のみ）
        valid_stream.start_pass();
        let model_valid = model.valid();
        let mut valid_meter = EpochMeter::default();
        for _ in 0..valid_steps {
            let batch = valid_stream.next_batch()?;
            let output = model_valid.forward_classification(batch.images, batch.targets);
            valid_meter.update(&output);
        }

        let checkpoint = checkpointer.save(&model)?;
        history.checkpoint_writes += 1;
        history.state = history.state.end_epoch();

        info!(
            "  → loss: {:.4}, acc: {:.2}% | val_loss: {:.4}, val_acc: {:.2}%",
            train_meter.mean_loss(),
            train_meter.accuracy() * 100.0,
            valid_meter.mean_loss(),
            valid_meter.accuracy() * 100.0
        );

        history.epochs.push(EpochMetrics {
            epoch,
            train_steps: train_meter.steps,
            train_loss: train_meter.mean_loss(),
            train_accuracy: train_meter.accuracy(),
            valid_steps: valid_meter.steps,
            valid_loss: valid_meter.mean_loss(),
            valid_accuracy: valid_meter.accuracy(),
            checkpoint,
        });
    }

    Ok((model, history))
}

/// 学習済みモデルをメタデータ付きのtar.gzとして書き出す
///
/// 特徴抽出器を含むモデル全体を保存するため、推論時に元の重みファイルは不要。
pub fn export_trained_model<B: Backend>(
    model: &TransferModel<B>,
    config: &AppConfig,
    history: &TrainingHistory,
    output_path: &Path,
) -> Result<PathBuf> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| TransferError::Recorder(format!("{:?}", e)))?;

    let metadata = ModelMetadata::new(
        config.data.class_names.clone(),
        config.model.image_size as u32,
        config.data.augmentation.rescale,
        config.model.backbone.clone(),
        model.is_backbone_frozen(),
        history.epochs.len() as u32,
        history.last().map(|m| m.valid_accuracy),
    );

    save_model_with_metadata(output_path, &metadata, &model_binary)
}

/// 学習の成果物
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: TransferModel<B>,
    pub history: TrainingHistory,
    pub checkpoint: PathBuf,
    pub exported: Option<PathBuf>,
}

/// 設定に従って学習を最初から最後まで実行
///
/// データ・設定の不備は学習開始前に検出してエラーを返す。
pub fn run_training<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
) -> Result<TrainingOutcome<B>> {
    config.validate()?;

    let labels = ClassLabels::new(config.data.class_names.clone())?;
    let splits = DatasetSplits::load(Path::new(&config.data.root), &labels)?;

    let image_size = config.model.image_size;
    let batch_size = config.training.batch_size;
    let mut train_stream = BatchStream::<B>::training(
        splits.train,
        batch_size,
        image_size,
        config.data.augmentation.clone(),
        config.training.seed,
        device,
    )?;
    let mut valid_stream = BatchStream::<B::InnerBackend>::validation(
        splits.validation,
        batch_size,
        image_size,
        config.data.augmentation.rescale,
        device,
    )?;

    let weights = config.model.backbone_weights.as_ref().map(PathBuf::from);
    let backbone = load_backbone::<B>(&config.model.backbone, weights.as_deref(), device)?;
    let model = assemble_model(backbone, image_size, config.model.freeze_backbone, device)?;

    let checkpointer = Checkpointer::new(&config.checkpoint.dir, &config.checkpoint.tag)?;
    let (model, history) = train(
        model,
        &mut train_stream,
        &mut valid_stream,
        &config.training,
        &checkpointer,
    )?;

    history.save_json(&checkpointer.dir().join("history.json"))?;

    let exported = match config.export_path.as_deref() {
        Some(path) => Some(export_trained_model(&model, config, &history, Path::new(path))?),
        None => None,
    };

    Ok(TrainingOutcome {
        model,
        history,
        checkpoint: checkpointer.file_path(),
        exported,
    })
}
