//! MNIST dataset in IDX format.
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

static TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
static TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
static TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
static TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

/// IDX parsing errors.
#[derive(Debug, Snafu)]
pub enum IdxError {
    #[snafu(display("Cannot open IDX file: {}", path.to_string_lossy()))]
    Open { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot read IDX {what}"))]
    Read { source: io::Error, what: &'static str },

    #[snafu(display("Invalid IDX magic number, expected {expected}, got {got}"))]
    Magic { expected: u32, got: u32 },

    #[snafu(display("IDX {what} ends after {got} of {expected} bytes"))]
    Truncated {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[snafu(display("IDX image dimensions are too large: {n_images}x{n_rows}x{n_cols}"))]
    Size {
        n_images: usize,
        n_rows: usize,
        n_cols: usize,
    },

    #[snafu(display("Image count ({n_images}) does not match label count ({n_labels})"))]
    CountMismatch { n_images: usize, n_labels: usize },

    #[snafu(display("Cannot convert IDX data to tensor"))]
    ToTensor { source: candle_core::Error },
}

/// Images read from an IDX file.
#[derive(Clone, Debug)]
pub struct IdxImages {
    n_rows: usize,
    n_cols: usize,
    pixels: Vec<u8>,
}

impl IdxImages {
    /// Parse images from an IDX reader.
    pub fn parse(mut reader: impl Read) -> Result<Self, IdxError> {
        let magic = read_u32(&mut reader, "header")?;
        ensure!(
            magic == IMAGES_MAGIC,
            MagicSnafu {
                expected: IMAGES_MAGIC,
                got: magic
            }
        );
        let n_images = read_u32(&mut reader, "header")? as usize;
        let n_rows = read_u32(&mut reader, "header")? as usize;
        let n_cols = read_u32(&mut reader, "header")? as usize;

        let n_pixels = n_images
            .checked_mul(n_rows)
            .and_then(|n| n.checked_mul(n_cols))
            .context(SizeSnafu {
                n_images,
                n_rows,
                n_cols,
            })?;
        let pixels = read_bytes(&mut reader, n_pixels, "pixels")?;

        Ok(Self {
            n_rows,
            n_cols,
            pixels,
        })
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        match self.image_size() {
            0 => 0,
            size => self.pixels.len() / size,
        }
    }

    /// Whether there are no images.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image height.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Image width.
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Number of pixels per image.
    pub fn image_size(&self) -> usize {
        self.n_rows * self.n_cols
    }

    /// Raw pixels of the image at `index`, `None` when out of range.
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        if index >= self.len() {
            return None;
        }
        let size = self.image_size();
        self.pixels.get(index * size..(index + 1) * size)
    }
}

/// Parse labels from an IDX reader.
pub fn parse_idx_labels(mut reader: impl Read) -> Result<Vec<u8>, IdxError> {
    let magic = read_u32(&mut reader, "header")?;
    ensure!(
        magic == LABELS_MAGIC,
        MagicSnafu {
            expected: LABELS_MAGIC,
            got: magic
        }
    );
    let n_labels = read_u32(&mut reader, "header")? as usize;
    read_bytes(&mut reader, n_labels, "labels")
}

/// Read exactly `n` bytes without trusting `n` for the allocation.
fn read_bytes(
    reader: &mut impl Read,
    n: usize,
    what: &'static str,
) -> Result<Vec<u8>, IdxError> {
    let mut bytes = Vec::new();
    reader
        .take(n as u64)
        .read_to_end(&mut bytes)
        .context(ReadSnafu { what })?;
    ensure!(
        bytes.len() == n,
        TruncatedSnafu {
            what,
            expected: n,
            got: bytes.len()
        }
    );
    Ok(bytes)
}

fn read_u32(reader: &mut impl Read, what: &'static str) -> Result<u32, IdxError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).context(ReadSnafu { what })?;
    Ok(u32::from_be_bytes(buf))
}

/// A labelled image split.
#[derive(Clone, Debug)]
pub struct LabelledImages {
    images: IdxImages,
    labels: Vec<u8>,
}

impl LabelledImages {
    /// Pair images with their labels.
    pub fn new(images: IdxImages, labels: Vec<u8>) -> Result<Self, IdxError> {
        ensure!(
            images.len() == labels.len(),
            CountMismatchSnafu {
                n_images: images.len(),
                n_labels: labels.len()
            }
        );
        Ok(Self { images, labels })
    }

    /// The images.
    pub fn images(&self) -> &IdxImages {
        &self.images
    }

    /// The labels.
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Raw pixel values as a float tensor.
    ///
    /// *Shape:* `(n_samples, n_rows * n_cols)`
    pub fn pixels(&self, device: &Device) -> Result<Tensor, IdxError> {
        let data = self
            .images
            .pixels
            .iter()
            .map(|&p| p as f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (self.len(), self.images.image_size()), device)
            .context(ToTensorSnafu)
    }

    /// Labels as a `u32` tensor.
    ///
    /// *Shape:* `(n_samples,)`
    pub fn label_tensor(&self, device: &Device) -> Result<Tensor, IdxError> {
        let data = self.labels.iter().map(|&l| l as u32).collect::<Vec<_>>();
        Tensor::from_vec(data, self.len(), device).context(ToTensorSnafu)
    }
}

/// MNIST training and test splits.
#[derive(Clone, Debug)]
pub struct Mnist {
    pub train: LabelledImages,
    pub test: LabelledImages,
}

impl Mnist {
    /// Load MNIST from a directory with the four uncompressed IDX files.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, IdxError> {
        let dir = dir.as_ref();
        tracing::info!(dir = %dir.display(), "Loading MNIST dataset");
        let train = LabelledImages::new(
            IdxImages::parse(open(dir.join(TRAIN_IMAGES))?)?,
            parse_idx_labels(open(dir.join(TRAIN_LABELS))?)?,
        )?;
        let test = LabelledImages::new(
            IdxImages::parse(open(dir.join(TEST_IMAGES))?)?,
            parse_idx_labels(open(dir.join(TEST_LABELS))?)?,
        )?;
        tracing::debug!(
            n_train = train.len(),
            n_test = test.len(),
            "Loaded MNIST dataset"
        );
        Ok(Self { train, test })
    }
}

fn open(path: PathBuf) -> Result<BufReader<File>, IdxError> {
    let file = File::open(&path).context(OpenSnafu { path })?;
    Ok(BufReader::new(file))
}

/// Render an image as ASCII art.
///
/// Pixels are expected in `[0, 1]`, those above one half are drawn as `@`.
pub fn render(pixels: &[f32], n_cols: usize) -> String {
    pixels
        .chunks(n_cols.max(1))
        .map(|row| {
            row.iter()
                .map(|&p| if p > 0.5 { '@' } else { '.' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
