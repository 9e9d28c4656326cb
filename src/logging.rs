//! ログ出力の初期化
//!
//! ライブラリ側は `tracing` のマクロで出力し、バイナリ起動時にのみ購読者を登録します。

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 出力する最小レベル
    pub level: Level,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使うか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用の詳細設定
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_target: true,
            ..Self::default()
        }
    }
}

/// グローバルなログ購読者を登録
///
/// 既に登録済みの場合は何もしません（テストから複数回呼ばれても安全）。
pub fn init_logging(config: &LogConfig) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_target(config.include_target)
        .with_ansi(config.ansi_colors)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("ログ購読者は既に登録されています");
    }
}
