#![recursion_limit = "256"]

//! 転移学習の実行
//!
//! 使い方: `train [config.json]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::NdArray;
use clap::Parser;
use tracing::info;

use catdog_transfer::logging::{init_logging, LogConfig};
use catdog_transfer::ml::run_training;
use catdog_transfer::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train", about = "犬猫分類モデルの転移学習")]
struct Args {
    /// 設定ファイル（省略時は ./config.json、無ければデフォルト設定）
    config: Option<PathBuf>,
}

fn run<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<()> {
    let outcome = run_training::<B>(config, device).context("学習に失敗しました")?;

    info!("=== 学習結果 ===");
    for metrics in &outcome.history.epochs {
        info!(
            "Epoch {}: loss {:.4}, acc {:.2}% | val_loss {:.4}, val_acc {:.2}% ({} / {} steps)",
            metrics.epoch,
            metrics.train_loss,
            metrics.train_accuracy * 100.0,
            metrics.valid_loss,
            metrics.valid_accuracy * 100.0,
            metrics.train_steps,
            metrics.valid_steps
        );
    }
    info!(
        "チェックポイント: {} (書き込み {} 回)",
        outcome.checkpoint.display(),
        outcome.history.checkpoint_writes
    );
    if let Some(path) = &outcome.exported {
        info!("モデル: {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging(&LogConfig::default());
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    config.display();

    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            info!("使用デバイス: {:?}", device);
            run::<Autodiff<Wgpu>>(&config, &device)
        }
        DeviceType::Cpu => {
            let device = Default::default();
            info!("使用デバイス: CPU (NdArray)");
            run::<Autodiff<NdArray<f32>>>(&config, &device)
        }
    }
}
