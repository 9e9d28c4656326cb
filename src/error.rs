//! エラー型の定義
//!
//! データ・設定・リソースの3系統に分けて扱います。
//! いずれも学習開始前または発生箇所で呼び出し元へ伝播し、内部で回復はしません。

use std::path::PathBuf;

use thiserror::Error;

/// ライブラリ全体のエラー型
#[derive(Error, Debug)]
pub enum TransferError {
    /// クラスディレクトリが存在しない
    #[error("クラスディレクトリが存在しません: {0}")]
    MissingClassDir(PathBuf),

    /// クラスディレクトリに画像が1枚もない
    #[error("クラス '{class_name}' に画像がありません: {dir}")]
    EmptyClass { class_name: String, dir: PathBuf },

    /// 学習用と検証用に同じ画像が含まれている
    #[error("学習データと検証データに重複があります: {0}")]
    OverlappingSplits(PathBuf),

    /// 画像の読み込み・デコード失敗
    #[error("画像の読み込みに失敗しました {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 設定値の不整合
    #[error("設定エラー: {0}")]
    Config(String),

    /// チェックポイントの保存・読み込み失敗
    #[error("チェックポイントエラー {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    /// モデルアーカイブ (tar.gz) の不備
    #[error("アーカイブエラー: {0}")]
    Archive(String),

    /// Burnのレコーダーエラー
    #[error("モデル重みの変換エラー: {0}")]
    Recorder(String),

    /// JSONのシリアライズ・デシリアライズ失敗
    #[error("シリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IOエラー
    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// 設定エラーを作成
    pub fn config(message: impl Into<String>) -> Self {
        TransferError::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
