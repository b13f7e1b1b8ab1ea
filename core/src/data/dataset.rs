use super::{DataError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

/// Marker written once a dataset has been fully unpacked.
pub const SUCCESS_SENTINEL: &str = ".success";

/// Sub-directory holding the training images, one directory per class.
pub const TRAIN_DIR: &str = "train";

const RELEASE_URL: &str = "https://github.com/ghostplant/lite-dnn/releases/download/lite-dataset";

/// Archive URL of the dataset named `name` (e.g. `catsdogs`).
pub fn dataset_url(name: &str) -> String {
    format!("{RELEASE_URL}/images-{name}.tar.gz")
}

/// Makes sure the dataset in `dir` is present, streaming it through
/// `curl | tar` if the sentinel is missing. Returns whether a download ran.
pub fn ensure_dataset(dir: &Path) -> Result<bool> {
    ensure_dataset_with(dir, fetch_archive)
}

/// [`ensure_dataset`] with a custom fetcher, called as `fetch(url, dir)` after
/// `dir` has been created.
///
/// # Errors
///
/// [`DataError::Download`] if creating `dir`, fetching, or writing the
/// sentinel fails.
pub fn ensure_dataset_with<F>(dir: &Path, fetch: F) -> Result<bool>
where
    F: FnOnce(&str, &Path) -> io::Result<()>,
{
    let sentinel = dir.join(SUCCESS_SENTINEL);
    if sentinel.exists() {
        return Ok(false);
    }
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            DataError::Download(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no dataset name in {}", dir.display()),
            ))
        })?;
    info!("Downloading dataset {name} ..");

    fs::create_dir_all(dir).map_err(DataError::Download)?;
    fetch(&dataset_url(name), dir).map_err(DataError::Download)?;
    fs::File::create(&sentinel).map_err(DataError::Download)?;
    Ok(true)
}

fn fetch_archive(url: &str, dir: &Path) -> io::Result<()> {
    let mut curl = Command::new("curl");
    curl.arg("-sSL").arg(url);
    let mut tar = Command::new("tar");
    tar.arg("xzf").arg("-").arg("-C").arg(dir);
    pipe(curl, tar)
}

/// Runs `producer | consumer` without a shell; both must exit successfully.
fn pipe(mut producer: Command, mut consumer: Command) -> io::Result<()> {
    let mut upstream = producer.stdout(Stdio::piped()).spawn()?;
    let stdout = upstream
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("producer stdout not captured"))?;
    let downstream = consumer
        .stdin(Stdio::from(stdout))
        .stdout(Stdio::null())
        .status();
    let upstream = upstream.wait()?;
    let downstream = downstream?;
    for (command, status) in [(&producer, upstream), (&consumer, downstream)] {
        if !status.success() {
            return Err(io::Error::other(format!(
                "`{}` exited with {status}",
                command.get_program().to_string_lossy()
            )));
        }
    }
    Ok(())
}

/// Class directories under `root`, sorted by name.
pub fn class_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Number of class sub-directories under `<dir>/train`.
pub fn class_count(dir: &Path) -> Result<usize> {
    Ok(class_dirs(&dir.join(TRAIN_DIR))?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_url() {
        assert_eq!(
            dataset_url("catsdogs"),
            "https://github.com/ghostplant/lite-dnn/releases/download/lite-dataset/images-catsdogs.tar.gz"
        );
    }

    #[test]
    fn test_sentinel_skips_fetch() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("catsdogs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SUCCESS_SENTINEL), b"").unwrap();
        let fetched = ensure_dataset_with(&dir, |_, _| panic!("must not fetch")).unwrap();
        assert!(!fetched);
    }

    #[test]
    fn test_fetch_writes_sentinel() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("flowers");
        let fetched = ensure_dataset_with(&dir, |url, target| {
            assert!(url.ends_with("images-flowers.tar.gz"));
            fs::create_dir_all(target.join("train/a"))?;
            fs::create_dir_all(target.join("train/b"))?;
            fs::write(target.join("train/readme"), b"x")
        })
        .unwrap();
        assert!(fetched);
        assert!(dir.join(SUCCESS_SENTINEL).exists());
        assert_eq!(class_count(&dir).unwrap(), 2);
    }

    #[test]
    fn test_failed_fetch_reports_fixed_message() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("catsdogs");
        let err = ensure_dataset_with(&dir, |_, _| Err(io::Error::other("404"))).unwrap_err();
        assert!(matches!(err, DataError::Download(_)));
        assert_eq!(err.to_string(), "Failed to download dataset.");
        assert!(!dir.join(SUCCESS_SENTINEL).exists());
    }

    #[test]
    fn test_class_dirs_sorted() {
        let root = tempfile::tempdir().unwrap();
        for class in ["dog", "cat", "bird"] {
            fs::create_dir_all(root.path().join(class)).unwrap();
        }
        fs::write(root.path().join("labels.txt"), b"").unwrap();
        let names: Vec<_> = class_dirs(root.path())
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_owned))
            .collect();
        assert_eq!(names, ["bird", "cat", "dog"]);
    }

    #[test]
    fn test_pipe_keeps_quoted_paths_intact() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"payload").unwrap();
        let target = root.path().join("it's a 'dir'");
        fs::create_dir_all(&target).unwrap();

        let mut pack = Command::new("tar");
        pack.arg("czf").arg("-").arg("-C").arg(&source).arg(".");
        let mut unpack = Command::new("tar");
        unpack.arg("xzf").arg("-").arg("-C").arg(&target);
        pipe(pack, unpack).unwrap();
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"payload");
    }

    #[test]
    fn test_pipe_fails_on_producer_status() {
        let err = pipe(Command::new("false"), Command::new("cat")).unwrap_err();
        assert!(err.to_string().contains("`false` exited"), "{err}");
    }
}
