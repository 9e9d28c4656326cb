//! 特徴抽出器（VGG系の畳み込みベース）
//!
//! 学習済みの重みを外部ファイルから読み込み、画像を空間特徴マップへ変換します。
//! 全結合層（分類部）は含みません。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};
use tracing::{info, warn};

use crate::error::TransferError;

/// 特徴抽出器の構成
#[derive(Config, Debug)]
pub struct VggBackboneConfig {
    /// 各ブロックの出力チャネル数
    pub block_channels: Vec<usize>,
    /// 各ブロックの畳み込み層数
    pub convs_per_block: Vec<usize>,
    /// 想定する入力画像サイズ（正方形）
    pub input_size: usize,
    /// 入力チャネル数（RGB）
    #[config(default = 3)]
    pub in_channels: usize,
}

impl VggBackboneConfig {
    /// VGG16の畳み込みベース（include_top = false 相当）
    pub fn vgg16(input_size: usize) -> Self {
        Self::new(vec![64, 128, 256, 512, 512], vec![2, 2, 3, 3, 3], input_size)
    }

    /// ブロック数（= Max Pooling の回数）
    pub fn num_blocks(&self) -> usize {
        self.block_channels.len()
    }

    /// 出力特徴マップの一辺のサイズ
    ///
    /// 2x2 Max Pooling（stride 2）でブロックごとに半分（切り捨て）になる。
    pub fn output_size(&self) -> usize {
        (0..self.num_blocks()).fold(self.input_size, |size, _| size / 2)
    }

    /// 出力特徴マップのチャネル数
    pub fn output_channels(&self) -> usize {
        self.block_channels
            .last()
            .copied()
            .unwrap_or(self.in_channels)
    }

    /// 構成の整合性を検証
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.block_channels.is_empty() {
            return Err(TransferError::config("特徴抽出器のブロックが空です"));
        }
        if self.block_channels.len() != self.convs_per_block.len() {
            return Err(TransferError::config(format!(
                "block_channels ({}) と convs_per_block ({}) の長さが一致しません",
                self.block_channels.len(),
                self.convs_per_block.len()
            )));
        }
        if self.block_channels.contains(&0) || self.convs_per_block.contains(&0) {
            return Err(TransferError::config("チャネル数・畳み込み層数に0は指定できません"));
        }
        if self.output_size() == 0 {
            return Err(TransferError::config(format!(
                "入力サイズが小さすぎます: {} ({}回のPoolingで特徴マップが消失します)",
                self.input_size,
                self.num_blocks()
            )));
        }
        Ok(())
    }

    /// 特徴抽出器を初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggBackbone<B> {
        let mut blocks = Vec::with_capacity(self.num_blocks());
        let mut in_channels = self.in_channels;

        for (&out_channels, &num_convs) in self.block_channels.iter().zip(&self.convs_per_block) {
            let convs = (0..num_convs)
                .map(|i| {
                    let channels_in = if i == 0 { in_channels } else { out_channels };
                    // 3x3 (padding 1, stride 1): 空間サイズを保つ
                    Conv2dConfig::new([channels_in, out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device)
                })
                .collect();

            blocks.push(ConvBlock {
                convs,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                activation: Relu::new(),
            });
            in_channels = out_channels;
        }

        VggBackbone {
            blocks,
            input_size: self.input_size,
            output_size: self.output_size(),
            output_channels: self.output_channels(),
        }
    }
}

/// {Conv 3x3 + ReLU} x N + MaxPool 2x2
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for conv in &self.convs {
            x = self.activation.forward(conv.forward(x));
        }
        self.pool.forward(x)
    }
}

/// VGG系特徴抽出器
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    input_size: usize,
    output_size: usize,
    output_channels: usize,
}

impl<B: Backend> VggBackbone<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, channels, out_size, out_size]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(images, |x, block| block.forward(x))
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }
}

/// 特徴抽出器を構築し、学習済み重みがあれば読み込む
///
/// # 引数
/// - `config`: 特徴抽出器の構成
/// - `weights`: `DefaultFileRecorder` 形式の重みファイル（拡張子 `.mpk` は省略可）
/// - `device`: 計算デバイス
pub fn load_backbone<B: Backend>(
    config: &VggBackboneConfig,
    weights: Option<&Path>,
    device: &B::Device,
) -> crate::error::Result<VggBackbone<B>> {
    config.validate()?;
    let backbone = config.init::<B>(device);

    let Some(path) = weights else {
        warn!("学習済み重みが指定されていません。ランダム初期化の特徴抽出器を使用します");
        return Ok(backbone);
    };

    let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
    let backbone = backbone
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TransferError::Recorder(format!("{}: {:?}", path.display(), e)))?;

    info!(
        "学習済み重みを読み込みました: {} ({} params)",
        path.display(),
        backbone.num_params()
    );
    Ok(backbone)
}
