//! 学習データの読み込みとバッチ生成
//!
//! `<root>/{train,validation}/<class>/*.jpg` の構成から画像パスとラベルを集め、
//! エポックごとにシャッフルしながら固定サイズのバッチを遅延生成します。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::ml::ml_model::load_and_normalize_image_with_size;
use crate::model::config::AugmentationSettings;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "webp"];

/// クラス名とラベル番号の対応
///
/// ラベル番号は指定された並び順で決まり、ディレクトリの走査順には依存しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(TransferError::config("クラスが指定されていません"));
        }
        let unique: HashSet<&String> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(TransferError::config(format!(
                "クラス名が重複しています: {}",
                names.join(", ")
            )));
        }
        Ok(Self { names })
    }

    /// クラス名からラベル番号を取得
    pub fn label_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// ラベル番号からクラス名を取得
    pub fn name_of(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassLabels {
    /// cats = 0, dogs = 1
    fn default() -> Self {
        Self {
            names: vec!["cats".to_string(), "dogs".to_string()],
        }
    }
}

/// データセットアイテム（画像パスとラベルのみ保持）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// クラス別ディレクトリから集めた画像データセット
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    items: Vec<ImageItem>,
    labels: ClassLabels,
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
}

impl ImageFolderDataset {
    /// `split_dir/<class>/` から画像を読み込む
    ///
    /// クラス内のファイルはパス順に並べるため、同じディレクトリからは常に同じ順序になる。
    ///
    /// # エラー
    /// - クラスディレクトリが存在しない
    /// - クラスディレクトリに画像が1枚もない
    pub fn from_directory(split_dir: &Path, labels: &ClassLabels) -> Result<Self> {
        let mut items = Vec::new();

        for (label, class_name) in labels.names().iter().enumerate() {
            let class_dir = split_dir.join(class_name);
            if !class_dir.is_dir() {
                return Err(TransferError::MissingClassDir(class_dir));
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    paths.push(path);
                }
            }

            if paths.is_empty() {
                return Err(TransferError::EmptyClass {
                    class_name: class_name.clone(),
                    dir: class_dir,
                });
            }

            paths.sort();
            info!("  クラス {} '{}': {} 枚", label, class_name, paths.len());
            items.extend(paths.into_iter().map(|path| ImageItem { path, label }));
        }

        Ok(Self {
            items,
            labels: labels.clone(),
        })
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// クラスごとの枚数（ラベル順）
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.labels.len()];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 学習用・検証用のデータセット
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageFolderDataset,
    pub validation: ImageFolderDataset,
}

impl DatasetSplits {
    /// `root/train` と `root/validation` を読み込む
    ///
    /// 両方に同じ画像ファイルが含まれている場合はエラー。
    pub fn load(root: &Path, labels: &ClassLabels) -> Result<Self> {
        info!("学習データ: {}", root.join("train").display());
        let train = ImageFolderDataset::from_directory(&root.join("train"), labels)?;
        info!("検証データ: {}", root.join("validation").display());
        let validation = ImageFolderDataset::from_directory(&root.join("validation"), labels)?;

        let canonical = |path: &Path| std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let train_paths: HashSet<PathBuf> = train.items().iter().map(|i| canonical(&i.path)).collect();
        if let Some(item) = validation
            .items()
            .iter()
            .find(|i| train_paths.contains(&canonical(&i.path)))
        {
            return Err(TransferError::OverlappingSplits(item.path.clone()));
        }

        info!(
            "学習データ: {} 枚, 検証データ: {} 枚",
            train.len(),
            validation.len()
        );
        Ok(Self { train, validation })
    }
}

/// デコード済みの1サンプル
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub path: PathBuf,
    /// (C, H, W) の順で平坦化した画素値
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// 各サンプルの元画像
    pub paths: Vec<PathBuf>,
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, DecodedImage, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<DecodedImage>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);
        let mut paths = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
            paths.push(item.path);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        ImageBatch {
            images,
            targets,
            paths,
        }
    }
}

/// 終わりのないバッチ列
///
/// 1パスの残りが1バッチに満たない場合は次のパスを開始する（端数は捨てる）。
/// 学習用はパスごとに順序をシャッフルし、検証用はデータセットの順序を保つ。
pub struct BatchStream<B: Backend> {
    dataset: ImageFolderDataset,
    batcher: ImageBatcher,
    device: B::Device,
    batch_size: usize,
    image_size: usize,
    augmentation: AugmentationSettings,
    /// Some の場合は学習用（シャッフル + データ拡張）
    rng: Option<StdRng>,
    order: Vec<usize>,
    cursor: usize,
    passes: usize,
}

impl<B: Backend> BatchStream<B> {
    /// 学習用のバッチ列
    pub fn training(
        dataset: ImageFolderDataset,
        batch_size: usize,
        image_size: usize,
        augmentation: AugmentationSettings,
        seed: u64,
        device: &B::Device,
    ) -> Result<Self> {
        Self::new(
            dataset,
            batch_size,
            image_size,
            augmentation,
            Some(StdRng::seed_from_u64(seed)),
            device,
        )
    }

    /// 検証用のバッチ列（順序固定、rescale以外の拡張なし）
    pub fn validation(
        dataset: ImageFolderDataset,
        batch_size: usize,
        image_size: usize,
        rescale: f32,
        device: &B::Device,
    ) -> Result<Self> {
        let augmentation = AugmentationSettings {
            rescale,
            horizontal_flip: false,
        };
        Self::new(dataset, batch_size, image_size, augmentation, None, device)
    }

    fn new(
        dataset: ImageFolderDataset,
        batch_size: usize,
        image_size: usize,
        augmentation: AugmentationSettings,
        rng: Option<StdRng>,
        device: &B::Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TransferError::config("バッチサイズは1以上である必要があります"));
        }
        if dataset.len() < batch_size {
            return Err(TransferError::config(format!(
                "画像数 ({}) がバッチサイズ ({}) より少ないため1ステップも実行できません",
                dataset.len(),
                batch_size
            )));
        }

        Ok(Self {
            dataset,
            batcher: ImageBatcher::new(image_size),
            device: device.clone(),
            batch_size,
            image_size,
            augmentation,
            rng,
            order: Vec::new(),
            cursor: 0,
            passes: 0,
        })
    }

    /// 1エポックあたりのステップ数（端数切り捨て）
    pub fn steps_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 開始したパスの数
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn dataset(&self) -> &ImageFolderDataset {
        &self.dataset
    }

    /// 新しいパスを開始（学習用なら順序をシャッフル）
    pub fn start_pass(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
        self.cursor = 0;
        self.passes += 1;
        debug!("パス {} を開始 ({} 枚)", self.passes, self.order.len());
    }

    /// 次のバッチを読み込む
    ///
    /// # エラー
    /// - 画像のデコードに失敗した場合（そのサンプルは致命的エラーとして扱う）
    pub fn next_batch(&mut self) -> Result<ImageBatch<B>> {
        if self.cursor + self.batch_size > self.order.len() {
            self.start_pass();
        }

        let indices = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;

        let mut decoded = Vec::with_capacity(self.batch_size);
        for index in indices {
            let item = &self.dataset.items()[index];
            let flip = match self.rng.as_mut() {
                Some(rng) if self.augmentation.horizontal_flip => rng.gen_bool(0.5),
                _ => false,
            };
            let pixels = load_and_normalize_image_with_size(
                &item.path,
                self.image_size,
                self.augmentation.rescale,
                flip,
            )?;
            decoded.push(DecodedImage {
                path: item.path.clone(),
                pixels,
                label: item.label,
            });
        }

        Ok(Batcher::<B, DecodedImage, ImageBatch<B>>::batch(
            &self.batcher,
            decoded,
            &self.device,
        ))
    }
}

impl<B: Backend> Iterator for BatchStream<B> {
    type Item = Result<ImageBatch<B>>;

    /// 常に次のバッチを返す（終端なし）
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    /// `root/<split>/<class>/` に単色画像を作成
    fn write_class(root: &Path, split: &str, class: &str, count: usize, value: u8) {
        let dir = root.join(split).join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            RgbImage::from_pixel(12, 10, Rgb([value, value, value]))
                .save(dir.join(format!("{class}.{i}.png")))
                .unwrap();
        }
    }

    fn labels() -> ClassLabels {
        ClassLabels::default()
    }

    #[test]
    fn test_class_labels_mapping() {
        let labels = labels();
        assert_eq!(labels.label_of("cats"), Some(0));
        assert_eq!(labels.label_of("dogs"), Some(1));
        assert_eq!(labels.name_of(1), Some("dogs"));
        assert_eq!(labels.label_of("birds"), None);
    }

    #[test]
    fn test_class_labels_reject_duplicates() {
        let result = ClassLabels::new(vec!["cats".to_string(), "cats".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_labels_follow_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 2, 0);
        write_class(dir.path(), "train", "dogs", 3, 255);

        let reversed = ClassLabels::new(vec!["dogs".to_string(), "cats".to_string()]).unwrap();
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &reversed).unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.class_counts(), vec![3, 2]);
        for item in dataset.items() {
            let class_dir = item.path.parent().unwrap().file_name().unwrap();
            assert_eq!(reversed.label_of(&class_dir.to_string_lossy()), Some(item.label));
        }
    }

    #[test]
    fn test_non_image_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 1, 0);
        write_class(dir.path(), "train", "dogs", 1, 255);
        std::fs::write(dir.path().join("train/cats/notes.txt"), b"skip").unwrap();

        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_empty_class_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 2, 0);
        std::fs::create_dir_all(dir.path().join("train/dogs")).unwrap();

        let result = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels());
        assert!(matches!(result, Err(TransferError::EmptyClass { ref class_name, .. }) if class_name == "dogs"));
    }

    #[test]
    fn test_missing_class_dir_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 2, 0);

        let result = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels());
        assert!(matches!(result, Err(TransferError::MissingClassDir(_))));
    }

    #[test]
    fn test_splits_load_both() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 4, 0);
        write_class(dir.path(), "train", "dogs", 4, 255);
        write_class(dir.path(), "validation", "cats", 2, 0);
        write_class(dir.path(), "validation", "dogs", 2, 255);

        let splits = DatasetSplits::load(dir.path(), &labels()).unwrap();
        assert_eq!(splits.train.len(), 8);
        assert_eq!(splits.validation.len(), 4);
    }

    #[test]
    fn test_splits_require_validation_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 4, 0);
        write_class(dir.path(), "train", "dogs", 4, 255);
        write_class(dir.path(), "validation", "cats", 2, 0);

        assert!(DatasetSplits::load(dir.path(), &labels()).is_err());
    }

    #[test]
    fn test_batch_shape_range_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 3, 10);
        write_class(dir.path(), "train", "dogs", 3, 250);
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        let device = Default::default();

        let mut stream = BatchStream::<TestBackend>::training(
            dataset,
            4,
            8,
            AugmentationSettings::default(),
            7,
            &device,
        )
        .unwrap();

        for _ in 0..3 {
            let batch = stream.next_batch().unwrap();
            assert_eq!(batch.images.dims(), [4, 3, 8, 8]);

            let pixels: Vec<f32> = batch.images.into_data().to_vec().unwrap();
            assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));

            let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
            for (path, target) in batch.paths.iter().zip(targets) {
                let class_dir = path.parent().unwrap().file_name().unwrap().to_string_lossy();
                assert!(target == 0 || target == 1);
                assert_eq!(labels().label_of(&class_dir), Some(target as usize));
            }
        }
        // 6枚 / 4 -> 1ステップごとに新しいパス
        assert_eq!(stream.passes(), 3);
    }

    #[test]
    fn test_validation_order_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "validation", "cats", 3, 0);
        write_class(dir.path(), "validation", "dogs", 3, 255);
        let dataset =
            ImageFolderDataset::from_directory(&dir.path().join("validation"), &labels()).unwrap();
        let expected: Vec<PathBuf> = dataset.items().iter().map(|i| i.path.clone()).collect();
        let device = Default::default();

        let mut stream =
            BatchStream::<TestBackend>::validation(dataset, 3, 8, 1.0 / 255.0, &device).unwrap();
        assert_eq!(stream.steps_per_epoch(), 2);

        for _ in 0..2 {
            stream.start_pass();
            let mut seen = Vec::new();
            for _ in 0..stream.steps_per_epoch() {
                seen.extend(stream.next_batch().unwrap().paths);
            }
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_training_shuffle_covers_each_sample_once_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 4, 0);
        write_class(dir.path(), "train", "dogs", 4, 255);
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        let device = Default::default();

        let mut stream = BatchStream::<TestBackend>::training(
            dataset,
            2,
            8,
            AugmentationSettings::default(),
            3,
            &device,
        )
        .unwrap();
        stream.start_pass();

        let mut seen: Vec<PathBuf> = Vec::new();
        for _ in 0..stream.steps_per_epoch() {
            seen.extend(stream.next_batch().unwrap().paths);
        }
        let unique: HashSet<&PathBuf> = seen.iter().collect();
        assert_eq!(seen.len(), 8);
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn test_stream_is_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 1, 0);
        write_class(dir.path(), "train", "dogs", 1, 255);
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        let device = Default::default();

        let stream = BatchStream::<TestBackend>::training(
            dataset,
            2,
            4,
            AugmentationSettings::default(),
            0,
            &device,
        )
        .unwrap();

        assert_eq!(stream.take(5).filter(|b| b.is_ok()).count(), 5);
    }

    #[test]
    fn test_batch_larger_than_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 1, 0);
        write_class(dir.path(), "train", "dogs", 1, 255);
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        let device = Default::default();

        let result = BatchStream::<TestBackend>::validation(dataset, 3, 4, 1.0 / 255.0, &device);
        assert!(matches!(result, Err(TransferError::Config(_))));
    }

    #[test]
    fn test_corrupt_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "train", "cats", 1, 0);
        write_class(dir.path(), "train", "dogs", 1, 255);
        std::fs::write(dir.path().join("train/dogs/broken.jpg"), b"garbage").unwrap();
        let dataset = ImageFolderDataset::from_directory(&dir.path().join("train"), &labels()).unwrap();
        let device = Default::default();

        let mut stream =
            BatchStream::<TestBackend>::validation(dataset, 3, 4, 1.0 / 255.0, &device).unwrap();
        assert!(matches!(stream.next_batch(), Err(TransferError::Image { .. })));
    }
}
