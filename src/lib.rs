//! 学習済みVGG特徴抽出器を固定した転移学習による犬猫分類

pub mod error;
pub mod logging;
pub mod ml;
pub mod model;

pub use error::{Result, TransferError};
