//! モデルメタデータから推論に必要な情報を取り出す

use tracing::info;

use crate::model::model_metadata::ModelMetadata;

/// 陽性クラスと判定する確率の閾値
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// 推論設定
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスラベル（並び順 = ラベル番号）
    pub class_labels: Vec<String>,

    /// モデル入力解像度
    pub image_size: u32,

    /// 画素値の係数
    pub rescale: f32,

    /// ラベル1と判定する確率の閾値
    pub threshold: f32,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            image_size: metadata.image_size,
            rescale: metadata.rescale,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// 陽性クラスの確率からラベル番号を決める
    pub fn label_for_probability(&self, probability: f32) -> usize {
        if probability >= self.threshold {
            1
        } else {
            0
        }
    }

    /// クラスインデックスからラベル名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<String> {
        self.class_labels.get(index).cloned()
    }

    /// ラベル名からクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Option<usize> {
        self.class_labels.iter().position(|l| l == label)
    }

    /// 設定情報をログに出力
    pub fn print_info(&self) {
        info!("=== 推論設定 ===");
        info!("クラス: {}", self.class_labels.join(", "));
        info!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        info!("閾値: {}", self.threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::VggBackboneConfig;

    fn config() -> InferenceConfig {
        let metadata = ModelMetadata::new(
            vec!["cats".to_string(), "dogs".to_string()],
            200,
            1.0 / 255.0,
            VggBackboneConfig::vgg16(200),
            true,
            2,
            None,
        );
        InferenceConfig::from_metadata(&metadata)
    }

    #[test]
    fn test_label_lookup() {
        let config = config();
        assert_eq!(config.num_classes(), 2);
        assert_eq!(config.class_index_to_label(0).as_deref(), Some("cats"));
        assert_eq!(config.class_index_to_label(2), None);
        assert_eq!(config.label_to_index("dogs"), Some(1));
    }

    #[test]
    fn test_threshold() {
        let config = config();
        assert_eq!(config.label_for_probability(0.2), 0);
        assert_eq!(config.label_for_probability(0.5), 1);
        assert_eq!(config.label_for_probability(0.97), 1);
    }
}
