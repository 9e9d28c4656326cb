#![recursion_limit = "256"]

//! 学習済みモデルで画像を分類
//!
//! 使い方: `classify <model.tar.gz> <画像...>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{wgpu::WgpuDevice, Wgpu};
use clap::Parser;

use catdog_transfer::logging::{init_logging, LogConfig};
use catdog_transfer::ml::InferenceEngine;
use catdog_transfer::model::{load_metadata, print_metadata_info};

#[derive(Parser, Debug)]
#[command(name = "classify", about = "学習済みモデルで犬猫を判定")]
struct Args {
    /// 学習済みモデル (tar.gz)
    model: PathBuf,
    /// 判定する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    init_logging(&LogConfig::default());
    let args = Args::parse();

    let device = WgpuDevice::default();
    let engine = InferenceEngine::<Wgpu>::load(&args.model, &device)
        .with_context(|| format!("モデルを読み込めません: {}", args.model.display()))?;
    let metadata = load_metadata(&args.model)?;
    print_metadata_info(&metadata);
    engine.config().print_info();

    for path in &args.images {
        match engine.classify_image(path) {
            Ok(prediction) => println!(
                "{}\t{}\t{:.4}",
                path.display(),
                prediction.class_name,
                prediction.probability
            ),
            Err(e) => eprintln!("{}\tエラー: {}", path.display(), e),
        }
    }
    Ok(())
}
