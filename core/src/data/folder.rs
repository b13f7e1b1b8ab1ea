use super::{dataset, Batch, BatchSource, DataError, Result};
use crate::tensor::{self, Tensor, TensorElem};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Images laid out one class per sub-directory (`<root>/<class>/<file>`).
///
/// Classes are numbered by sorted directory name. Samples are drawn in a
/// shuffled order that is reshuffled after every pass. Images are resized to
/// `height x width` and pixels are scaled by `1/255`.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    batch_size: usize,
    image: [usize; 3],
    classes: usize,
    samples: Vec<(PathBuf, usize)>,
    order: Vec<usize>,
    cursor: usize,
    seed: u64,
    rng: StdRng,
}

impl ImageFolder {
    /// Indexes every image under `root`.
    ///
    /// # Errors
    ///
    /// [`DataError::Layout`] if `image` asks for other than 1 or 3 channels
    /// or `root` holds no images.
    pub fn open(root: &Path, batch_size: usize, image: [usize; 3], seed: u64) -> Result<Self> {
        if !matches!(image[0], 1 | 3) {
            return Err(DataError::Layout(format!(
                "cannot decode images into {} channels",
                image[0]
            )));
        }
        let class_dirs = dataset::class_dirs(root)?;
        let mut samples = Vec::new();
        for (label, dir) in class_dirs.iter().enumerate() {
            let mut files = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_file() && has_image_extension(&path) {
                    files.push(path);
                }
            }
            files.sort();
            samples.extend(files.into_iter().map(|path| (path, label)));
        }
        if samples.is_empty() {
            return Err(DataError::Layout(format!("no images under {}", root.display())));
        }

        let mut folder = Self {
            batch_size,
            image,
            classes: class_dirs.len(),
            order: (0..samples.len()).collect(),
            samples,
            cursor: 0,
            seed,
            rng: StdRng::seed_from_u64(seed),
        };
        folder.order.shuffle(&mut folder.rng);
        Ok(folder)
    }

    /// Same index, drawn in its own order.
    pub fn with_seed(&self, seed: u64) -> Self {
        let mut folder = self.clone();
        folder.seed = seed;
        BatchSource::<f32>::reset(&mut folder);
        folder
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn next_sample(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let sample = self.order[self.cursor];
        self.cursor += 1;
        sample
    }
}

impl<T: TensorElem> BatchSource<T> for ImageFolder {
    fn next_batch(&mut self) -> Result<Batch<T>> {
        let [c, h, w] = self.image;
        let mut pixels = Vec::with_capacity(self.batch_size * c * h * w);
        let mut labels = vec![T::zero(); self.batch_size * self.classes];
        for row in 0..self.batch_size {
            let sample = self.next_sample();
            let (path, label) = &self.samples[sample];
            load_pixels(path, self.image, &mut pixels)?;
            labels[row * self.classes + label] = T::one();
        }
        let pixels = pixels
            .into_iter()
            .map(tensor::elem::<T>)
            .collect::<tensor::Result<Vec<T>>>()?;

        Ok(Batch {
            images: Tensor::new(pixels, [self.batch_size, c, h, w])?,
            labels: Tensor::new(labels, [self.batch_size, self.classes])?,
        })
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.order = (0..self.samples.len()).collect();
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Appends the CHW pixels of `path`, resized to `[c, h, w]`, in `[0, 1]`.
fn load_pixels(path: &Path, [c, h, w]: [usize; 3], out: &mut Vec<f64>) -> Result<()> {
    let decoded = image::open(path).map_err(|source| DataError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let (width, height) = match (u32::try_from(w), u32::try_from(h)) {
        (Ok(width), Ok(height)) => (width, height),
        _ => return Err(DataError::Layout(format!("image size {h}x{w} too large"))),
    };
    let resized = decoded.resize_exact(width, height, FilterType::Triangle);
    let hwc = if c == 1 {
        resized.to_luma8().into_raw()
    } else {
        resized.to_rgb8().into_raw()
    };
    for channel in 0..c {
        out.extend(
            hwc.iter()
                .skip(channel)
                .step_by(c)
                .map(|&p| f64::from(p) / 255.0),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

    fn write_folder(root: &Path) {
        let classes = [
            ("cat", RED, vec!["a.png", "b.png"]),
            ("dog", BLUE, vec!["c.png"]),
        ];
        for (class, color, files) in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for file in files {
                RgbImage::from_pixel(6, 5, color).save(dir.join(file)).unwrap();
            }
            fs::write(dir.join("notes.txt"), b"skip me").unwrap();
        }
    }

    #[test]
    fn test_labels_follow_sorted_directories() {
        let root = tempfile::tempdir().unwrap();
        write_folder(root.path());
        let mut folder = ImageFolder::open(root.path(), 3, [3, 4, 4], 1).unwrap();
        assert_eq!(folder.classes(), 2);
        assert_eq!(folder.len(), 3);

        // One batch is one full pass over the three images.
        let batch: Batch<f32> = folder.next_batch().unwrap();
        assert_eq!(batch.images.shape(), &[3, 3, 4, 4]);
        assert_eq!(batch.labels.shape(), &[3, 2]);
        let mut cats = 0;
        for (image, label) in batch
            .images
            .data()
            .chunks(3 * 16)
            .zip(batch.labels.data().chunks(2))
        {
            assert_eq!(label.iter().sum::<f32>(), 1.0);
            let (lit, dark) = if label[0] == 1.0 {
                cats += 1;
                (&image[..16], &image[32..])
            } else {
                (&image[32..], &image[..16])
            };
            assert!(lit.iter().all(|&p| p > 0.99), "{lit:?}");
            assert!(dark.iter().all(|&p| p < 0.01), "{dark:?}");
            assert!(image[16..32].iter().all(|&p| p < 0.01));
        }
        assert_eq!(cats, 2);
    }

    #[test]
    fn test_reset_and_reseed() {
        let root = tempfile::tempdir().unwrap();
        write_folder(root.path());
        let mut folder = ImageFolder::open(root.path(), 2, [1, 3, 3], 5).unwrap();
        let first: Batch<f64> = folder.next_batch().unwrap();
        assert!(first.images.data().iter().all(|p| (0.0..=1.0).contains(p)));
        BatchSource::<f64>::reset(&mut folder);
        assert_eq!(folder.next_batch().unwrap(), first);

        let other = folder.with_seed(6);
        assert_eq!(other.len(), folder.len());
        assert_eq!(other.classes(), 2);
    }

    #[test]
    fn test_rejects_empty_or_unsupported() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("empty")).unwrap();
        assert!(matches!(
            ImageFolder::open(root.path(), 1, [3, 4, 4], 0),
            Err(DataError::Layout(_))
        ));
        write_folder(root.path());
        assert!(matches!(
            ImageFolder::open(root.path(), 1, [2, 4, 4], 0),
            Err(DataError::Layout(_))
        ));
    }

    #[test]
    fn test_corrupt_image_names_its_path() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("cat");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("broken.png"), b"not a png").unwrap();
        let mut folder = ImageFolder::open(root.path(), 1, [3, 4, 4], 0).unwrap();
        let err = BatchSource::<f32>::next_batch(&mut folder).unwrap_err();
        assert!(matches!(err, DataError::Decode { .. }));
        assert!(err.to_string().contains("broken.png"));
    }
}
