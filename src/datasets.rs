//! Loads image classification datasets stored in the IDX format (MNIST, Fashion-MNIST)
//! and generates small two dimensional datasets which need no files
//!
//! Images are flattened to one row per sample and normalized the same way as the
//! classic `ToTensor()` + `Normalize((0.5,), (0.5,))` transform: pixels are scaled to
//! `[0, 1]`, then shifted by the mean and divided by the standard deviation.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt};
use clap::ValueEnum;
use ndarray::{Array2, Axis, s};
use rand::Rng;
use thiserror::Error;

/// Magic number of IDX files holding unsigned byte images (3 dimensions)
const IMAGES_MAGIC: u32 = 0x0000_0803;
/// Magic number of IDX files holding unsigned byte labels (1 dimension)
const LABELS_MAGIC: u32 = 0x0000_0801;

const FASHION_CLASSES: [&str; 10] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle boot",
];

/// Errors for loading datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to open '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Bad IDX magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("IDX data ended early")]
    Truncated(#[source] io::Error),
    #[error("IDX header claims {n_images} images of {rows}x{cols}, too many pixels")]
    TooLarge {
        n_images: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Found {images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("Label {label} is out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("Normalization std must be positive, got {0}")]
    InvalidStd(f32),
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Mnist,
    FashionMnist,
    Line,
    Circle,
    Xor,
    Moon,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Mnist => write!(f, "mnist"),
            Dataset::FashionMnist => write!(f, "fashion-mnist"),
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::Xor => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

/// Which half of a dataset to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    /// File name prefix used by the MNIST distribution
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

/// Per-channel normalization applied after scaling pixels to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalize {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalize {
    fn default() -> Self {
        Self { mean: 0.5, std: 0.5 }
    }
}

impl Normalize {
    pub fn new(mean: f32, std: f32) -> Result<Self, DatasetError> {
        if std.is_nan() || std <= 0.0 {
            return Err(DatasetError::InvalidStd(std));
        }
        Ok(Self { mean, std })
    }

    /// Scales raw pixels of `images` to a `(n_images, rows * cols)` matrix
    pub fn apply(&self, images: &IdxImages) -> Array2<f32> {
        let n_features = images.rows * images.cols;
        Array2::from_shape_fn((images.n_images, n_features), |(i, j)| {
            let pixel = images.pixels[i * n_features + j] as f32 / 255.0;
            (pixel - self.mean) / self.std
        })
    }
}

/// Raw contents of an IDX image file
#[derive(Debug, Clone)]
pub struct IdxImages {
    pub n_images: usize,
    pub rows: usize,
    pub cols: usize,
    /// row-major pixels, image after image
    pub pixels: Vec<u8>,
}

fn read_magic<R: Read>(reader: &mut R, expected: u32) -> Result<(), DatasetError> {
    let found = reader
        .read_u32::<BigEndian>()
        .map_err(DatasetError::Truncated)?;
    if found != expected {
        return Err(DatasetError::BadMagic { expected, found });
    }
    Ok(())
}

fn read_dim<R: Read>(reader: &mut R) -> Result<usize, DatasetError> {
    reader
        .read_u32::<BigEndian>()
        .map(|d| d as usize)
        .map_err(DatasetError::Truncated)
}

/// Reads exactly `len` bytes, the buffer grows only as data arrives
fn read_bytes<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, DatasetError> {
    let mut bytes = Vec::new();
    reader
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut bytes)
        .map_err(DatasetError::Truncated)?;
    if bytes.len() < len {
        return Err(DatasetError::Truncated(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", len, bytes.len()),
        )));
    }
    Ok(bytes)
}

/// Reads an IDX image file: magic, image count, rows, cols (big endian u32), then pixels
pub fn read_idx_images<R: Read>(mut reader: R) -> Result<IdxImages, DatasetError> {
    read_magic(&mut reader, IMAGES_MAGIC)?;
    let n_images = read_dim(&mut reader)?;
    let rows = read_dim(&mut reader)?;
    let cols = read_dim(&mut reader)?;
    let n_pixels = n_images
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or(DatasetError::TooLarge {
            n_images,
            rows,
            cols,
        })?;
    let pixels = read_bytes(&mut reader, n_pixels)?;
    log::debug!("Read {} images of {}x{}", n_images, rows, cols);
    Ok(IdxImages {
        n_images,
        rows,
        cols,
        pixels,
    })
}

/// Reads an IDX label file: magic, label count (big endian u32), then one byte per label
pub fn read_idx_labels<R: Read>(mut reader: R) -> Result<Vec<u8>, DatasetError> {
    read_magic(&mut reader, LABELS_MAGIC)?;
    let n_labels = read_dim(&mut reader)?;
    read_bytes(&mut reader, n_labels)
}

fn open(path: &Path) -> Result<BufReader<File>, DatasetError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Samples with their class labels, one sample per row of `inputs`
#[derive(Debug, Clone)]
pub struct LabeledData {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
    pub n_classes: usize,
    pub class_names: Vec<String>,
}

impl LabeledData {
    /// Pairs decoded IDX images with their labels
    pub fn from_idx(
        images: &IdxImages,
        labels: &[u8],
        normalize: Normalize,
        class_names: Vec<String>,
    ) -> Result<Self, DatasetError> {
        if images.n_images != labels.len() {
            return Err(DatasetError::CountMismatch {
                images: images.n_images,
                labels: labels.len(),
            });
        }
        let n_classes = class_names.len();
        let labels = labels
            .iter()
            .map(|&l| {
                let label = l as usize;
                if label < n_classes {
                    Ok(label)
                } else {
                    Err(DatasetError::LabelOutOfRange { label, n_classes })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            inputs: normalize.apply(images),
            labels,
            n_classes,
            class_names,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.inputs.ncols()
    }

    /// Keeps only the first `n` samples
    pub fn take(mut self, n: usize) -> Self {
        let n = n.min(self.len());
        self.inputs = self.inputs.slice(s![..n, ..]).to_owned();
        self.labels.truncate(n);
        self
    }

    /// Returns the `index`-th sample as a `(1, n_features)` matrix
    pub fn sample(&self, index: usize) -> Option<(Array2<f32>, usize)> {
        let label = *self.labels.get(index)?;
        let row = self.inputs.row(index).insert_axis(Axis(0)).to_owned();
        Some((row, label))
    }
}

/// Where and how to load a dataset
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// directory holding the uncompressed IDX files
    pub data_dir: PathBuf,
    pub normalize: Normalize,
    /// number of points per class for the generated datasets
    pub class_size: usize,
}

/// Loads a dataset based on the dataset type, the generated datasets draw their points
/// from `rng`
pub fn load_dataset<R: Rng + ?Sized>(
    dataset: Dataset,
    split: Split,
    options: &LoadOptions,
    rng: &mut R,
) -> Result<LabeledData, DatasetError> {
    let data = match dataset {
        Dataset::Mnist => load_mnist(
            &options.data_dir,
            split,
            options.normalize,
            (0..10).map(|d| d.to_string()).collect(),
        )?,
        Dataset::FashionMnist => load_mnist(
            &options.data_dir,
            split,
            options.normalize,
            FASHION_CLASSES.iter().map(|c| c.to_string()).collect(),
        )?,
        Dataset::Line => gen_linear_data(options.class_size, &mut *rng),
        Dataset::Circle => gen_circle_data(options.class_size, &mut *rng),
        Dataset::Xor => gen_xor_data(options.class_size, &mut *rng),
        Dataset::Moon => gen_moon_data(options.class_size, &mut *rng),
    };
    log::info!(
        "Loaded {} {:?} samples of {} with {} features",
        data.len(),
        split,
        dataset,
        data.n_features()
    );
    Ok(data)
}

/// Loads `{prefix}-images-idx3-ubyte` and `{prefix}-labels-idx1-ubyte` from `data_dir`
pub fn load_mnist(
    data_dir: &Path,
    split: Split,
    normalize: Normalize,
    class_names: Vec<String>,
) -> Result<LabeledData, DatasetError> {
    let prefix = split.file_prefix();
    let images_path = data_dir.join(format!("{}-images-idx3-ubyte", prefix));
    let labels_path = data_dir.join(format!("{}-labels-idx1-ubyte", prefix));
    let images = read_idx_images(open(&images_path)?)?;
    let labels = read_idx_labels(open(&labels_path)?)?;
    LabeledData::from_idx(&images, &labels, normalize, class_names)
}

fn two_class_data(points: Vec<[f32; 2]>, labels: Vec<usize>) -> LabeledData {
    let n = points.len();
    let inputs = Array2::from_shape_fn((n, 2), |(i, j)| points[i][j]);
    LabeledData {
        inputs,
        labels,
        n_classes: 2,
        class_names: vec!["class 0".to_string(), "class 1".to_string()],
    }
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> LabeledData {
    let mut points = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        points.push([x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    two_class_data(points, labels)
}

/// Generates a binary classification dataset of two concentric circles
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> LabeledData {
    let mut points = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25..0.25);
            let x = (radius + radius_delta) * angle.cos();
            let y = (radius + radius_delta) * angle.sin();
            points.push([x, y]);
            labels.push(label);
        }
    }

    two_class_data(points, labels)
}

/// Generates points in four quadrants, same-signed coordinates form class 0
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> LabeledData {
    let mut points = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        points.push([x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    two_class_data(points, labels)
}

/// Generates a moons dataset (two interleaving partial circles) for binary classification
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> LabeledData {
    let mut points = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0;

    for label in 0..2 {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if label == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            points.push([x + noise_x, y + noise_y]);
            labels.push(label);
        }
    }

    two_class_data(points, labels)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::WriteBytesExt;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    fn idx_images(n: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        for v in [IMAGES_MAGIC, n, rows, cols] {
            buf.write_u32::<BigEndian>(v).unwrap();
        }
        buf.extend_from_slice(pixels);
        buf
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_u32::<BigEndian>(LABELS_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(labels.len() as u32).unwrap();
        buf.extend_from_slice(labels);
        buf
    }

    fn digit_names() -> Vec<String> {
        (0..10).map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_read_idx() {
        let bytes = idx_images(2, 2, 2, &[0, 255, 51, 0, 1, 2, 3, 4]);
        let images = read_idx_images(Cursor::new(bytes)).unwrap();
        assert_eq!((images.n_images, images.rows, images.cols), (2, 2, 2));
        assert_eq!(images.pixels.len(), 8);

        let labels = read_idx_labels(Cursor::new(idx_labels(&[7, 3]))).unwrap();
        assert_eq!(labels, vec![7, 3]);

        let data =
            LabeledData::from_idx(&images, &labels, Normalize::default(), digit_names()).unwrap();
        assert_eq!(data.inputs.dim(), (2, 4));
        assert_eq!(data.labels, vec![7, 3]);
        // (0 / 255 - 0.5) / 0.5 = -1, (255 / 255 - 0.5) / 0.5 = 1
        assert_eq_float!(data.inputs[[0, 0]], -1.0);
        assert_eq_float!(data.inputs[[0, 1]], 1.0);
        assert_eq_float!(data.inputs[[0, 2]], -0.6);
    }

    #[test]
    fn test_read_idx_errors() {
        let err = read_idx_images(Cursor::new(idx_labels(&[1]))).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::BadMagic {
                expected: IMAGES_MAGIC,
                found: LABELS_MAGIC
            }
        ));

        // header promises 4 pixels, only 3 follow
        let err = read_idx_images(Cursor::new(idx_images(1, 2, 2, &[1, 2, 3]))).unwrap_err();
        assert!(matches!(err, DatasetError::Truncated(_)));

        let images = read_idx_images(Cursor::new(idx_images(1, 1, 1, &[0]))).unwrap();
        let err = LabeledData::from_idx(&images, &[1, 2], Normalize::default(), digit_names())
            .unwrap_err();
        assert!(matches!(err, DatasetError::CountMismatch { images: 1, labels: 2 }));
        let err = LabeledData::from_idx(&images, &[10], Normalize::default(), digit_names())
            .unwrap_err();
        assert!(matches!(err, DatasetError::LabelOutOfRange { label: 10, n_classes: 10 }));
    }

    #[test]
    fn test_read_idx_huge_header() {
        let header = idx_images(u32::MAX, u32::MAX, u32::MAX, &[]);
        let err = read_idx_images(Cursor::new(header)).unwrap_err();
        assert!(matches!(err, DatasetError::TooLarge { .. }));

        // the pixel count fits, but the file holds almost none of them
        let header = idx_images(u32::MAX, 28, 28, &[1, 2, 3]);
        let err = read_idx_images(Cursor::new(header)).unwrap_err();
        assert!(matches!(err, DatasetError::Truncated(_)));

        let mut labels = vec![];
        labels.write_u32::<BigEndian>(LABELS_MAGIC).unwrap();
        labels.write_u32::<BigEndian>(u32::MAX).unwrap();
        labels.push(4);
        let err = read_idx_labels(Cursor::new(labels)).unwrap_err();
        assert!(matches!(err, DatasetError::Truncated(_)));
    }

    #[test]
    fn test_normalize_rejects_bad_std() {
        assert!(matches!(Normalize::new(0.5, 0.0), Err(DatasetError::InvalidStd(_))));
        assert_eq!(Normalize::new(0.1307, 0.3081).unwrap().mean, 0.1307);
    }

    #[test]
    fn test_load_mnist_from_dir() {
        let dir = std::env::temp_dir().join(format!("nn-basics-idx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("t10k-images-idx3-ubyte"), idx_images(3, 1, 2, &[0; 6])).unwrap();
        std::fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[0, 1, 9])).unwrap();

        let options = LoadOptions {
            data_dir: dir.clone(),
            normalize: Normalize::default(),
            class_size: 0,
        };
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let data = load_dataset(Dataset::FashionMnist, Split::Test, &options, &mut rng).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.class_names[data.labels[2]], "Ankle boot");

        // the training files are missing
        let err = load_dataset(Dataset::Mnist, Split::Train, &options, &mut rng).unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_seeded_generated_datasets_repeat() {
        let options = LoadOptions {
            data_dir: PathBuf::from("unused"),
            normalize: Normalize::default(),
            class_size: 20,
        };
        let load = |seed| {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            load_dataset(Dataset::Moon, Split::Train, &options, &mut rng).unwrap()
        };
        assert_eq!(load(9).inputs, load(9).inputs);
        assert_ne!(load(9).inputs, load(10).inputs);
    }

    #[test]
    fn test_generated_datasets() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let xor = gen_xor_data(100, &mut rng);
        assert_eq!(xor.inputs.dim(), (100, 2));
        for (row, label) in xor.inputs.rows().into_iter().zip(xor.labels.iter()) {
            assert_eq!(*label, if row[0] * row[1] > 0.0 { 0 } else { 1 });
        }

        let circle = gen_circle_data(50, &mut rng);
        assert_eq!(circle.len(), 100);
        assert_eq!(circle.labels.iter().filter(|&&l| l == 1).count(), 50);

        let moon = gen_moon_data(10, &mut rng).take(5);
        assert_eq!(moon.len(), 5);
        assert_eq!(moon.inputs.nrows(), 5);

        let line = gen_linear_data(10, &mut rng);
        let (sample, label) = line.sample(4).unwrap();
        assert_eq!(sample.dim(), (1, 2));
        assert_eq!(label, line.labels[4]);
        assert!(line.sample(10).is_none());
    }
}
