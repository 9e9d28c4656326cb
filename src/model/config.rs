//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・データセット・モデル・学習ハイパーパラメータをJSON形式で保存・読み込みします。
//! 設定は各ステージへ明示的に渡し、プロセス全体で共有する可変状態は持ちません。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::ml::backbone::VggBackboneConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 画素値に掛ける係数（1/255 で [0, 1] に収まる）
    pub rescale: f32,
    /// 学習時にランダムで左右反転するか
    #[serde(default)]
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rescale: 1.0 / 255.0,
            horizontal_flip: false,
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// `train/` と `validation/` を含むルートディレクトリ
    pub root: String,
    /// クラスディレクトリ名（並び順がそのままラベル番号になる）
    pub class_names: Vec<String>,
    /// データ拡張
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            root: "data/cats_and_dogs_filtered".to_string(),
            class_names: vec!["cats".to_string(), "dogs".to_string()],
            augmentation: AugmentationSettings::default(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 特徴抽出器の構成
    pub backbone: VggBackboneConfig,
    /// 学習済み重みファイル（Burnのレコード形式）
    #[serde(default)]
    pub backbone_weights: Option<String>,
    /// 特徴抽出器の重みを固定するか
    pub freeze_backbone: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 200,
            backbone: VggBackboneConfig::vgg16(200),
            backbone_weights: Some("models/vgg16_notop.mpk".to_string()),
            freeze_backbone: true,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率（固定）
    pub learning_rate: f64,
    /// シャッフル用の乱数シード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 2,
            batch_size: 20,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}

/// チェックポイント設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// 保存先ディレクトリ
    pub dir: String,
    /// ファイル名 `ckpt_training_<tag>` のタグ部分
    pub tag: String,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: "training_checkpoints".to_string(),
            tag: "cats_vs_dogs".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// データセット設定
    pub data: DataSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// チェックポイント設定
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    /// 学習済みモデル (tar.gz) の出力先
    #[serde(default)]
    pub export_path: Option<String>,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習開始前に検出できる設定ミスをまとめて検証
    pub fn validate(&self) -> Result<()> {
        let training = &self.training;
        if training.batch_size == 0 {
            return Err(TransferError::config("バッチサイズは1以上である必要があります"));
        }
        if training.num_epochs == 0 {
            return Err(TransferError::config("エポック数は1以上である必要があります"));
        }
        if !training.learning_rate.is_finite() || training.learning_rate <= 0.0 {
            return Err(TransferError::config(format!(
                "学習率が不正です: {}",
                training.learning_rate
            )));
        }

        let names = &self.data.class_names;
        if names.len() != 2 {
            return Err(TransferError::config(format!(
                "二値分類のためクラスは2つ必要です (指定: {})",
                names.len()
            )));
        }
        if names[0] == names[1] {
            return Err(TransferError::config(format!(
                "クラス名が重複しています: {}",
                names[0]
            )));
        }

        let rescale = self.data.augmentation.rescale;
        if !rescale.is_finite() || rescale <= 0.0 {
            return Err(TransferError::config(format!(
                "rescale は正の値である必要があります: {}",
                rescale
            )));
        }
        // 8bit画素に掛けた結果が [0, 1] に収まること
        if rescale * 255.0 > 1.0 + 1e-6 {
            return Err(TransferError::config(format!(
                "rescale が大きすぎます（画素値が1を超えます）: {}",
                rescale
            )));
        }

        self.model.backbone.validate()?;
        if self.model.image_size != self.model.backbone.input_size {
            return Err(TransferError::config(format!(
                "入力サイズが特徴抽出器と一致しません: データ {}x{}, 特徴抽出器 {}x{}",
                self.model.image_size,
                self.model.image_size,
                self.model.backbone.input_size,
                self.model.backbone.input_size
            )));
        }

        let tag = &self.checkpoint.tag;
        if tag.is_empty() || tag.contains(['.', '/', '\\']) {
            return Err(TransferError::config(format!(
                "チェックポイントのタグが不正です: '{}'",
                tag
            )));
        }

        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("データセット: {}", self.data.root);
        info!("クラス: {}", self.data.class_names.join(", "));
        info!(
            "入力サイズ: {}x{}, 重み固定: {}",
            self.model.image_size, self.model.image_size, self.model.freeze_backbone
        );
        if let Some(ref weights) = self.model.backbone_weights {
            info!("学習済み重み: {}", weights);
        }
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
        info!(
            "チェックポイント: {}/ckpt_training_{}",
            self.checkpoint.dir, self.checkpoint.tag
        );
    }
}
