//! 学習済みモデルによる推論

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use serde::Serialize;

use crate::error::{Result, TransferError};
use crate::ml::ml_model::{assemble_model, load_and_normalize_image_with_size, TransferModel};
use crate::model::{load_model_with_metadata, InferenceConfig};

/// 1枚の画像に対する判定結果
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub path: PathBuf,
    /// 判定したラベル番号
    pub label: usize,
    pub class_name: String,
    /// ラベル1である確率
    pub probability: f32,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TransferModel<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    ///
    /// メタデータに記録された特徴抽出器の構成からモデルを組み立て、重みを復元する。
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);

        metadata.backbone.validate()?;
        let backbone = metadata.backbone.init::<B>(device);
        let model = assemble_model(
            backbone,
            metadata.image_size as usize,
            metadata.backbone_frozen,
            device,
        )?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, device)
            .map_err(|e| TransferError::Recorder(format!("モデル重みの読み込みエラー: {:?}", e)))?;
        let model = model.load_record(record);

        Ok(Self {
            model,
            config,
            device: device.clone(),
        })
    }

    /// 学習直後のモデルから推論エンジンを作成
    pub fn from_model(model: TransferModel<B>, config: InferenceConfig, device: &B::Device) -> Self {
        Self {
            model,
            config,
            device: device.clone(),
        }
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let mut predictions = self.classify_batch(&[image_path])?;
        predictions
            .pop()
            .ok_or_else(|| TransferError::config("推論結果が空です"))
    }

    /// 複数画像をまとめて分類
    pub fn classify_batch<P: AsRef<Path>>(&self, image_paths: &[P]) -> Result<Vec<Prediction>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.config.image_size as usize;
        let mut pixels = Vec::with_capacity(image_paths.len() * 3 * size * size);
        for path in image_paths {
            pixels.extend(load_and_normalize_image_with_size(
                path.as_ref(),
                size,
                self.config.rescale,
                false,
            )?);
        }

        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([image_paths.len(), 3, size, size]);
        let probabilities = self
            .model
            .forward(images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TransferError::Recorder(format!("推論結果の取得エラー: {:?}", e)))?;

        image_paths
            .iter()
            .zip(probabilities)
            .map(|(path, probability)| {
                let label = self.config.label_for_probability(probability);
                let class_name = self.config.class_index_to_label(label).ok_or_else(|| {
                    TransferError::config(format!("クラスインデックス {} は範囲外です", label))
                })?;
                Ok(Prediction {
                    path: path.as_ref().to_path_buf(),
                    label,
                    class_name,
                    probability,
                })
            })
            .collect()
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn model(&self) -> &TransferModel<B> {
        &self.model
    }
}
