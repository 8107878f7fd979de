//! Persistent cache of quantized matrices.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic u32 | version u32 | fingerprint u64
//! talker_layers u32 | sub_layers u32 | code_groups u32 | records u32
//! records × { name_len u32 | name | encoding u32 | rows u32 | cols u32 | len u64 | payload }
//! ```
//!
//! Records appear in manifest order. A file is accepted only when every
//! header field and every record layout matches what the current config
//! expects and nothing follows the last record.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::CacheError;
use crate::quant::{Encoding, QuantMatrix};

pub const MAGIC: u32 = u32::from_le_bytes(*b"QQC3");
pub const VERSION: u32 = 1;

/// Identity of the weights a cache was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    /// Byte size of the source shards
    pub fingerprint: u64,
    /// (talker layers, sub-talker layers, code groups)
    pub layers: (u32, u32, u32),
}

/// Expected name, encoding and shape of one cached matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSpec {
    pub name: String,
    pub encoding: Encoding,
    pub rows: usize,
    pub cols: usize,
}

impl MatrixSpec {
    pub fn new(name: impl Into<String>, encoding: Encoding, rows: usize, cols: usize) -> Self {
        Self {
            name: name.into(),
            encoding,
            rows,
            cols,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CacheError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(CacheError::Truncated(self.pos)),
        }
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }
}

/// Read and validate a cache file against `key` and `manifest`.
///
/// Every payload is copied into engine-owned memory before the mapping is
/// dropped.
pub(crate) fn read(path: &Path, key: &CacheKey, manifest: &[MatrixSpec]) -> Result<HashMap<String, QuantMatrix>, CacheError> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before this function returns.
    let map = unsafe { Mmap::map(&file)? };
    let mut r = Reader { buf: &map, pos: 0 };

    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(CacheError::Magic(magic));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(CacheError::Version(version));
    }
    let fingerprint = r.u64()?;
    if fingerprint != key.fingerprint {
        return Err(CacheError::Fingerprint {
            expected: key.fingerprint,
            found: fingerprint,
        });
    }
    let layers = (r.u32()?, r.u32()?, r.u32()?);
    if layers != key.layers {
        return Err(CacheError::LayerCount {
            expected: key.layers,
            found: layers,
        });
    }
    let records = r.u32()? as usize;
    if records != manifest.len() {
        return Err(CacheError::Layout {
            name: format!("<{records} records, expected {}>", manifest.len()),
        });
    }

    let mut out = HashMap::with_capacity(records);
    for spec in manifest {
        let name_len = r.u32()? as usize;
        let name = r.take(name_len)?;
        let encoding = Encoding::from_tag(r.u32()?);
        let rows = r.u32()? as usize;
        let cols = r.u32()? as usize;
        let len = r.u64()?;
        let layout_ok = name == spec.name.as_bytes()
            && encoding == Some(spec.encoding)
            && rows == spec.rows
            && cols == spec.cols
            && len == spec.encoding.payload_len(rows, cols) as u64;
        if !layout_ok {
            return Err(CacheError::Layout { name: spec.name.clone() });
        }
        let payload = r.take(len as usize)?;
        let matrix = QuantMatrix::from_payload(spec.encoding, rows, cols, payload)
            .ok_or_else(|| CacheError::Layout { name: spec.name.clone() })?;
        out.insert(spec.name.clone(), matrix);
    }

    let trailing = map.len() - r.pos;
    if trailing != 0 {
        return Err(CacheError::TrailingBytes(trailing));
    }
    Ok(out)
}

/// Write `matrices` (in manifest order) to `path` atomically.
///
/// The file is assembled under a temporary name in the same directory and
/// renamed into place, so readers never observe a partial cache.
pub(crate) fn write(path: &Path, key: &CacheKey, manifest: &[MatrixSpec], matrices: &HashMap<String, QuantMatrix>) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file());
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&key.fingerprint.to_le_bytes())?;
        w.write_all(&key.layers.0.to_le_bytes())?;
        w.write_all(&key.layers.1.to_le_bytes())?;
        w.write_all(&key.layers.2.to_le_bytes())?;
        w.write_all(&(manifest.len() as u32).to_le_bytes())?;
        for spec in manifest {
            let m = matrices
                .get(&spec.name)
                .filter(|m| m.encoding() == spec.encoding && m.rows() == spec.rows && m.cols() == spec.cols)
                .ok_or_else(|| CacheError::Layout { name: spec.name.clone() })?;
            w.write_all(&(spec.name.len() as u32).to_le_bytes())?;
            w.write_all(spec.name.as_bytes())?;
            w.write_all(&spec.encoding.tag().to_le_bytes())?;
            w.write_all(&(spec.rows as u32).to_le_bytes())?;
            w.write_all(&(spec.cols as u32).to_le_bytes())?;
            w.write_all(&(m.payload_len() as u64).to_le_bytes())?;
            m.write_payload(&mut w)?;
        }
        w.flush()?;
    }
    tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (CacheKey, Vec<MatrixSpec>, HashMap<String, QuantMatrix>) {
        let key = CacheKey {
            fingerprint: 1234,
            layers: (2, 1, 4),
        };
        let manifest = vec![
            MatrixSpec::new("a", Encoding::Q4K, 3, 256),
            MatrixSpec::new("b", Encoding::Int8, 5, 40),
            MatrixSpec::new("c", Encoding::Q8_0, 2, 64),
        ];
        let matrices = manifest
            .iter()
            .map(|s| {
                let w = (0..s.rows * s.cols).map(|i| ((i % 17) as f32 - 8.0) / 9.0).collect();
                (s.name.clone(), QuantMatrix::from_f32(w, s.rows, s.cols, s.encoding))
            })
            .collect();
        (key, manifest, matrices)
    }

    #[test]
    fn test_write_then_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.qcache");
        let (key, manifest, matrices) = fixture();
        write(&path, &key, &manifest, &matrices)?;
        let back = read(&path, &key, &manifest)?;
        assert_eq!(back, matrices);
        Ok(())
    }

    #[test]
    fn test_rejections() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.qcache");
        let (key, manifest, matrices) = fixture();
        write(&path, &key, &manifest, &matrices)?;

        let other = CacheKey { fingerprint: 99, ..key };
        assert!(matches!(read(&path, &other, &manifest), Err(CacheError::Fingerprint { .. })));
        let other = CacheKey { layers: (3, 1, 4), ..key };
        assert!(matches!(read(&path, &other, &manifest), Err(CacheError::LayerCount { .. })));

        let mut reshaped = manifest.clone();
        reshaped[1].rows = 6;
        assert!(matches!(read(&path, &key, &reshaped), Err(CacheError::Layout { .. })));

        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 10])?;
        assert!(matches!(read(&path, &key, &manifest), Err(CacheError::Truncated(_))));

        let mut extra = bytes.clone();
        extra.push(0);
        std::fs::write(&path, &extra)?;
        assert!(matches!(read(&path, &key, &manifest), Err(CacheError::TrailingBytes(1))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xff;
        std::fs::write(&path, &bad_magic)?;
        assert!(matches!(read(&path, &key, &manifest), Err(CacheError::Magic(_))));

        let mut bad_version = bytes;
        bad_version[4] = 9;
        std::fs::write(&path, &bad_version)?;
        assert!(matches!(read(&path, &key, &manifest), Err(CacheError::Version(9))));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let (key, manifest, _) = fixture();
        let err = read(Path::new("/nonexistent/model.qcache"), &key, &manifest);
        assert!(matches!(err, Err(CacheError::Io(_))));
    }
}
