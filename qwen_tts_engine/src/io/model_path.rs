//! Locating the files that make up a model directory.

use std::path::{Path, PathBuf};

use crate::error::LoadError;

/// Name of the quantized cache file.
pub const CACHE_FILE_NAME: &str = "model.qcache";

/// Subdirectory holding the codec decoder weights and config.
pub const CODEC_SUBDIR: &str = "speech_tokenizer";

/// Resolved paths inside a model directory.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub generation_config: PathBuf,
    pub codec_dir: PathBuf,
    pub codec_config: PathBuf,
    /// Directory the quantized cache is read from and written to
    pub cache_dir: PathBuf,
}

impl ModelPaths {
    pub fn new(root: impl AsRef<Path>, cache_dir: Option<&Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let codec_dir = root.join(CODEC_SUBDIR);
        Self {
            config: root.join("config.json"),
            generation_config: root.join("generation_config.json"),
            codec_config: codec_dir.join("config.json"),
            cache_dir: cache_dir.map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
            codec_dir,
            root,
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }
}

/// Safetensors shards in `dir`: either `model.safetensors` or the
/// `model-NNNNN-of-MMMMM.safetensors` set, in shard order.
pub fn find_shards(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut shards: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_shard_name)
        })
        .collect();
    if shards.is_empty() {
        return Err(LoadError::NoWeights(dir.to_path_buf()));
    }
    shards.sort();
    tracing::debug!(dir = %dir.display(), shards = shards.len(), "Found sharded weights");
    Ok(shards)
}

fn is_shard_name(name: &str) -> bool {
    let Some(stem) = name.strip_prefix("model-").and_then(|s| s.strip_suffix(".safetensors")) else {
        return false;
    };
    match stem.split_once("-of-") {
        Some((idx, total)) => {
            !idx.is_empty()
                && !total.is_empty()
                && idx.bytes().all(|b| b.is_ascii_digit())
                && total.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Total byte size of `files`. Changes whenever a shard is replaced by a
/// differently sized one, which is what invalidates the quantized cache.
pub fn source_fingerprint(files: &[PathBuf]) -> Result<u64, LoadError> {
    files.iter().try_fold(0u64, |acc, path| {
        let meta = std::fs::metadata(path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(acc + meta.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_names() {
        assert!(is_shard_name("model-00001-of-00002.safetensors"));
        assert!(is_shard_name("model-3-of-12.safetensors"));
        assert!(!is_shard_name("model.safetensors"));
        assert!(!is_shard_name("model-00001-of-.safetensors"));
        assert!(!is_shard_name("model-a-of-2.safetensors"));
        assert!(!is_shard_name("model-00001-of-00002.safetensors.index.json"));
    }

    #[test]
    fn test_find_shards_orders_and_fingerprints() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("model-00002-of-00002.safetensors"), [0u8; 7])?;
        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), [0u8; 5])?;
        std::fs::write(dir.path().join("config.json"), b"{}")?;
        let shards = find_shards(dir.path())?;
        assert_eq!(shards.len(), 2);
        assert!(shards[0].ends_with("model-00001-of-00002.safetensors"));
        assert_eq!(source_fingerprint(&shards)?, 12);
        Ok(())
    }

    #[test]
    fn test_no_weights() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(find_shards(dir.path()), Err(LoadError::NoWeights(_))));
        Ok(())
    }

    #[test]
    fn test_cache_dir_override() {
        let paths = ModelPaths::new("/models/tts", Some(Path::new("/tmp/cache")));
        assert_eq!(paths.cache_file(), PathBuf::from("/tmp/cache/model.qcache"));
        assert_eq!(paths.codec_config, PathBuf::from("/models/tts/speech_tokenizer/config.json"));
        let paths = ModelPaths::new("/models/tts", None);
        assert_eq!(paths.cache_file(), PathBuf::from("/models/tts/model.qcache"));
    }
}
