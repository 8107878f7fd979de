//! Read-only weight store over memory-mapped safetensors shards.
//!
//! Tensors are handed out as [`WeightView`]s that borrow the mapping. Anything
//! that must outlive the store (quantized matrices, f32 copies of small
//! vectors) is converted into an owned buffer at load time.

use std::path::{Path, PathBuf};

use candle_core::DType;
use candle_core::safetensors::MmapedSafetensors;
use half::{bf16, f16};

use crate::error::LoadError;
use crate::io::model_path::{find_shards, source_fingerprint};
use crate::quant::{Encoding, QuantMatrix};

/// All shards of one model directory, mapped once.
pub struct WeightStore {
    tensors: MmapedSafetensors,
    files: Vec<PathBuf>,
    fingerprint: u64,
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("files", &self.files)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// A tensor borrowed from the mapping.
#[derive(Debug, Clone)]
pub struct WeightView<'a> {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    data: &'a [u8],
}

impl WeightStore {
    /// Map every shard in `dir`.
    pub fn open(dir: &Path) -> Result<Self, LoadError> {
        let files = find_shards(dir)?;
        let fingerprint = source_fingerprint(&files)?;
        // SAFETY: the shards are mapped read-only and the engine never writes
        // to model files while a store is alive.
        let tensors = unsafe { MmapedSafetensors::multi(&files)? };
        tracing::debug!(
            dir = %dir.display(),
            shards = files.len(),
            bytes = fingerprint,
            "Mapped weight shards"
        );
        Ok(Self {
            tensors,
            files,
            fingerprint,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Total byte size of the mapped shards.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.get(name).is_ok()
    }

    /// Borrow tensor `name`. Only bf16, f16 and f32 tensors are accepted.
    pub fn view(&self, name: &str) -> Result<WeightView<'_>, LoadError> {
        let view = self
            .tensors
            .get(name)
            .map_err(|_| LoadError::MissingTensor(name.to_string()))?;
        let unsupported = || LoadError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{:?}", view.dtype()),
        };
        let dtype = DType::try_from(view.dtype()).map_err(|_| unsupported())?;
        if !matches!(dtype, DType::BF16 | DType::F16 | DType::F32) {
            return Err(unsupported());
        }
        Ok(WeightView {
            name: name.to_string(),
            dtype,
            shape: view.shape().to_vec(),
            data: view.data(),
        })
    }

    /// Owned f32 copy of `name`, which must have exactly `shape`.
    pub fn load_f32(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>, LoadError> {
        let view = self.view(name)?;
        view.expect_shape(shape)?;
        Ok(view.to_f32())
    }

    /// Decode row `row` of the 2-D tensor `name`, stored as `dtype`, into `out`.
    fn read_row(&self, name: &str, dtype: DType, row: usize, out: &mut [f32]) -> Result<(), LoadError> {
        let view = self
            .tensors
            .get(name)
            .map_err(|_| LoadError::MissingTensor(name.to_string()))?;
        decode_row(dtype, view.data(), row, out);
        Ok(())
    }

    /// Like [`Self::load_f32`] but an absent tensor yields `None`.
    pub fn load_f32_optional(&self, name: &str, shape: &[usize]) -> Result<Option<Vec<f32>>, LoadError> {
        if !self.contains(name) {
            tracing::debug!(tensor = name, "Optional tensor absent");
            return Ok(None);
        }
        self.load_f32(name, shape).map(Some)
    }

    /// Load a `[rows, cols]` matrix in `encoding`.
    ///
    /// A bf16 source requested as [`Encoding::Bf16`] is copied without a
    /// round trip through f32.
    pub fn load_matrix(&self, name: &str, rows: usize, cols: usize, encoding: Encoding) -> Result<QuantMatrix, LoadError> {
        let view = self.view(name)?;
        view.expect_shape(&[rows, cols])?;
        if encoding == Encoding::Bf16 && view.dtype == DType::BF16 {
            return Ok(QuantMatrix::from_bf16(view.to_bf16(), rows, cols));
        }
        Ok(QuantMatrix::from_f32(view.to_f32(), rows, cols, encoding))
    }

    /// Stack several matrices along the row axis and encode the result.
    ///
    /// `parts` lists `(name, rows)`; all parts share `cols`. Used for the
    /// fused QKV and gate/up projections.
    pub fn load_fused(&self, parts: &[(&str, usize)], cols: usize, encoding: Encoding) -> Result<QuantMatrix, LoadError> {
        let total_rows: usize = parts.iter().map(|&(_, r)| r).sum();
        let mut fused = Vec::with_capacity(total_rows * cols);
        for &(name, rows) in parts {
            let view = self.view(name)?;
            view.expect_shape(&[rows, cols])?;
            view.append_f32(&mut fused);
        }
        Ok(QuantMatrix::from_f32(fused, total_rows, cols, encoding))
    }
}

impl<'a> WeightView<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn expect_shape(&self, expected: &[usize]) -> Result<(), LoadError> {
        if self.shape != expected {
            return Err(LoadError::ShapeMismatch {
                name: self.name.clone(),
                expected: expected.to_vec(),
                actual: self.shape.clone(),
            });
        }
        Ok(())
    }

    fn elem_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    pub fn to_f32(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.data.len() / self.elem_size());
        self.append_f32(&mut out);
        out
    }

    fn append_f32(&self, out: &mut Vec<f32>) {
        match self.dtype {
            DType::BF16 => out.extend(
                self.data
                    .chunks_exact(2)
                    .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32()),
            ),
            DType::F16 => out.extend(
                self.data
                    .chunks_exact(2)
                    .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32()),
            ),
            _ => out.extend(
                self.data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ),
        }
    }

    pub fn to_bf16(&self) -> Vec<bf16> {
        match self.dtype {
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]))
                .collect(),
            _ => self.to_f32().into_iter().map(bf16::from_f32).collect(),
        }
    }

    /// Decode row `row` of a 2-D tensor into `out`.
    pub fn row_into(&self, row: usize, out: &mut [f32]) {
        debug_assert_eq!(self.shape.get(1).copied(), Some(out.len()));
        decode_row(self.dtype, self.data, row, out);
    }
}

fn decode_row(dtype: DType, data: &[u8], row: usize, out: &mut [f32]) {
    let cols = out.len();
    let es = dtype.size_in_bytes();
    let bytes = &data[row * cols * es..(row + 1) * cols * es];
    match dtype {
        DType::BF16 => {
            for (o, b) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *o = bf16::from_le_bytes([b[0], b[1]]).to_f32();
            }
        }
        DType::F16 => {
            for (o, b) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *o = f16::from_le_bytes([b[0], b[1]]).to_f32();
            }
        }
        _ => {
            for (o, b) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *o = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        }
    }
}

/// A 2-D table read one row at a time straight from the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingTable {
    name: String,
    dtype: DType,
    rows: usize,
    cols: usize,
}

impl EmbeddingTable {
    /// Check that `name` exists with shape `[rows, cols]`.
    pub fn bind(store: &WeightStore, name: &str, rows: usize, cols: usize) -> Result<Self, LoadError> {
        let view = store.view(name)?;
        view.expect_shape(&[rows, cols])?;
        Ok(Self {
            name: name.to_string(),
            dtype: view.dtype(),
            rows,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Copy row `row` into `out` as f32.
    pub fn lookup(&self, store: &WeightStore, row: usize, out: &mut [f32]) -> Result<(), LoadError> {
        if row >= self.rows {
            return Err(LoadError::RowOutOfRange {
                name: self.name.clone(),
                row,
                rows: self.rows,
            });
        }
        let cols = out.len().min(self.cols);
        store.read_row(&self.name, self.dtype, row, &mut out[..cols])
    }

    /// Add row `row` into `acc`.
    pub fn accumulate(
        &self,
        store: &WeightStore,
        row: usize,
        acc: &mut [f32],
        scratch: &mut Vec<f32>,
    ) -> Result<(), LoadError> {
        scratch.resize(self.cols, 0.0);
        self.lookup(store, row, scratch)?;
        for (a, s) in acc.iter_mut().zip(scratch.iter()) {
            *a += s;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;

    fn write_store(dir: &Path) -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        let a: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        tensors.insert("a".to_string(), Tensor::from_vec(a.clone(), (3, 4), &dev)?.to_dtype(DType::BF16)?);
        tensors.insert("b".to_string(), Tensor::from_vec(a, (3, 4), &dev)?);
        tensors.insert("c".to_string(), Tensor::from_vec(vec![1.0f32; 8], (2, 4), &dev)?.to_dtype(DType::F16)?);
        tensors.insert("ids".to_string(), Tensor::from_vec(vec![1i64, 2], 2, &dev)?);
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
        Ok(())
    }

    #[test]
    fn test_view_and_convert() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_store(dir.path())?;
        let store = WeightStore::open(dir.path())?;
        assert!(store.fingerprint() > 0);

        let a = store.load_f32("a", &[3, 4])?;
        let b = store.load_f32("b", &[3, 4])?;
        assert_eq!(a, b);
        assert_eq!(store.load_f32("c", &[2, 4])?, vec![1.0; 8]);

        let mut row = [0.0f32; 4];
        store.view("a")?.row_into(2, &mut row);
        assert_eq!(row, [4.0, 4.5, 5.0, 5.5]);
        Ok(())
    }

    #[test]
    fn test_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_store(dir.path())?;
        let store = WeightStore::open(dir.path())?;
        assert!(matches!(store.load_f32("missing", &[1]), Err(LoadError::MissingTensor(_))));
        assert!(matches!(store.load_f32("a", &[4, 3]), Err(LoadError::ShapeMismatch { .. })));
        assert!(matches!(store.view("ids"), Err(LoadError::UnsupportedDtype { .. })));
        assert!(store.load_f32_optional("missing", &[1])?.is_none());
        Ok(())
    }

    #[test]
    fn test_fused_and_bf16_matrices() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_store(dir.path())?;
        let store = WeightStore::open(dir.path())?;
        let fused = store.load_fused(&[("a", 3), ("c", 2)], 4, Encoding::F32)?;
        assert_eq!(fused.rows(), 5);
        let mut row = vec![0.0f32; 4];
        fused.dequantize_row(3, &mut row);
        assert_eq!(row, vec![1.0; 4]);

        let m = store.load_matrix("a", 3, 4, Encoding::Bf16)?;
        assert_eq!(m.encoding(), Encoding::Bf16);
        m.dequantize_row(1, &mut row);
        assert_eq!(row, vec![2.0, 2.5, 3.0, 3.5]);
        Ok(())
    }

    #[test]
    fn test_embedding_table() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_store(dir.path())?;
        let store = WeightStore::open(dir.path())?;
        assert!(EmbeddingTable::bind(&store, "a", 4, 3).is_err());
        let table = EmbeddingTable::bind(&store, "a", 3, 4)?;
        let mut acc = vec![1.0f32; 4];
        let mut scratch = Vec::new();
        table.accumulate(&store, 1, &mut acc, &mut scratch)?;
        assert_eq!(acc, vec![3.0, 3.5, 4.0, 4.5]);

        let mut row = [0.0f32; 4];
        assert!(matches!(
            table.lookup(&store, 3, &mut row),
            Err(LoadError::RowOutOfRange { row: 3, rows: 3, .. })
        ));

        // A table bound against another store reports the tensor as missing.
        let other = tempfile::tempdir()?;
        let dev = Device::Cpu;
        let tensors = HashMap::from([("z".to_string(), Tensor::zeros((1, 4), DType::F32, &dev)?)]);
        candle_core::safetensors::save(&tensors, other.path().join("model.safetensors"))?;
        let other = WeightStore::open(other.path())?;
        assert!(matches!(table.lookup(&other, 0, &mut row), Err(LoadError::MissingTensor(_))));
        Ok(())
    }
}
