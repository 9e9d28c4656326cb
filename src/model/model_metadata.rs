//! モデルメタデータの定義
//!
//! tar.gz形式で学習済みモデルと一緒に保存し、推論時にモデル構造の復元に使います。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ml::backbone::VggBackboneConfig;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（並び順 = ラベル番号）
    /// 例: ["cats", "dogs"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// 画素値の係数（学習時と同じ前処理を推論で再現する）
    pub rescale: f32,

    /// 特徴抽出器の構成
    pub backbone: VggBackboneConfig,

    /// 特徴抽出器を固定して学習したか
    pub backbone_frozen: bool,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 最終エポックの検証精度
    #[serde(default)]
    pub valid_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        image_size: u32,
        rescale: f32,
        backbone: VggBackboneConfig,
        backbone_frozen: bool,
        num_epochs: u32,
        valid_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_size,
            rescale,
            backbone,
            backbone_frozen,
            num_epochs,
            valid_accuracy,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keeps_backbone_config() {
        let metadata = ModelMetadata::new(
            vec!["cats".to_string(), "dogs".to_string()],
            200,
            1.0 / 255.0,
            VggBackboneConfig::vgg16(200),
            true,
            2,
            Some(0.9),
        );

        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.class_labels, metadata.class_labels);
        assert_eq!(restored.backbone.block_channels, vec![64, 128, 256, 512, 512]);
        assert_eq!(restored.backbone.input_size, 200);
        assert_eq!(restored.trained_at, metadata.trained_at);
        assert!(chrono::DateTime::parse_from_rfc3339(&restored.trained_at).is_ok());
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(ModelMetadata::from_json_string("{ not json").is_err());
    }
}
