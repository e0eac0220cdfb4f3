//! Weight store for the VNA compiler.
//!
//! Weight tensors are persisted one per file in a fixed little-endian
//! layout: a 128-byte header (magic, version, payload length, rank, eight
//! dimension slots, bits per element, quantization vendor/algorithm ids and
//! a 32-byte parameter block) followed by raw element data. The store
//! decodes payloads to `f32` for fold-in arithmetic and precision analysis
//! while remembering the on-disk scalar format for code emission.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use half::f16;

/// Header length in bytes; the payload starts immediately after.
pub const HEADER_LEN: usize = 128;

/// Maximum number of dimension slots in the header.
pub const MAX_RANK: usize = 8;

/// Errors raised while reading or writing weight files.
///
/// All of these are fatal to a compilation run: a model with an unreadable
/// weight tensor has no usable memory plan.
#[derive(Debug, thiserror::Error)]
pub enum WeightError {
    /// The file could not be read or written.
    #[error("weight file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file ends before the header or payload does.
    #[error("weight file '{}' is truncated ({detail})", .path.display())]
    Truncated { path: PathBuf, detail: String },

    /// The header declares more dimensions than the format allows.
    #[error("weight file '{}' declares rank {rank} (max {MAX_RANK})", .path.display())]
    BadRank { path: PathBuf, rank: u32 },

    /// Only quantization vendor 0 is recognized.
    #[error("weight file '{}' uses unknown quantization vendor {vendor}", .path.display())]
    UnknownVendor { path: PathBuf, vendor: u16 },

    /// The (algorithm, bits) combination is not a recognized scalar format.
    #[error(
        "weight file '{}' uses unsupported scalar format \
         (algorithm {algorithm}, {bits} bits)",
        .path.display()
    )]
    UnsupportedFormat {
        path: PathBuf,
        algorithm: u16,
        bits: u32,
    },
}

/// On-disk scalar format of a weight payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeightScalar {
    /// Algorithm 0, 16 bits: IEEE half precision.
    F16,
    /// Algorithm 0, 32 bits: IEEE single precision.
    F32,
    /// Algorithm 1, 16 bits: signed fixed point.
    I16,
    /// Algorithm 1, 8 bits: unsigned fixed point.
    U8,
}

impl WeightScalar {
    /// The C scalar type used when emitting the payload as an array.
    pub fn c_scalar(self) -> &'static str {
        match self {
            Self::F16 => "half",
            Self::F32 => "float",
            Self::I16 => "int16_t",
            Self::U8 => "uint8_t",
        }
    }

    /// The target enumerator describing the payload to the copy primitive.
    pub fn target_name(self) -> &'static str {
        match self {
            Self::F16 => "VNA_Float16",
            Self::F32 => "VNA_Float32",
            Self::I16 => "VNA_SFixed16",
            Self::U8 => "VNA_UFixed8",
        }
    }

    /// `true` for the floating-point formats.
    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32)
    }

    /// Width of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::I16 => 2,
            Self::U8 => 1,
        }
    }

    fn bits(self) -> u32 {
        self.byte_width() as u32 * 8
    }

    fn algorithm(self) -> u16 {
        match self {
            Self::F16 | Self::F32 => 0,
            Self::I16 | Self::U8 => 1,
        }
    }

    fn from_header(
        path: &Path,
        algorithm: u16,
        bits: u32,
    ) -> Result<Self, WeightError> {
        match (algorithm, bits) {
            (0, 16) => Ok(Self::F16),
            (0, 32) => Ok(Self::F32),
            (1, 16) => Ok(Self::I16),
            (1, 8) => Ok(Self::U8),
            _ => Err(WeightError::UnsupportedFormat {
                path: path.to_owned(),
                algorithm,
                bits,
            }),
        }
    }
}

/// A decoded weight tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightTensor {
    /// Declared dimension sizes.
    pub dims: Vec<usize>,
    /// On-disk scalar format.
    pub scalar: WeightScalar,
    /// Element values, decoded to `f32`. Fixed-point payloads hold the raw
    /// integer magnitudes; the fractional shift lives in tensor metadata.
    pub values: Vec<f32>,
}

impl WeightTensor {
    /// Largest absolute value in the payload.
    pub fn max_abs(&self) -> f32 {
        self.values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    /// `true` if any value is negative.
    pub fn has_negative(&self) -> bool {
        self.values.iter().any(|v| *v < 0.0)
    }

    /// Encodes this tensor into the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let elem = self.scalar.byte_width();
        let data_len = (self.values.len() * elem) as u32;

        let mut out = Vec::with_capacity(HEADER_LEN + data_len as usize);
        out.extend_from_slice(b"VN"); // magic
        out.push(1); // major version
        out.push(0); // minor version
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(&(self.dims.len() as u32).to_le_bytes());
        for slot in 0..MAX_RANK {
            let dim = self.dims.get(slot).copied().unwrap_or(0) as u32;
            out.extend_from_slice(&dim.to_le_bytes());
        }
        out.extend_from_slice(&self.scalar.bits().to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // vendor
        out.extend_from_slice(&self.scalar.algorithm().to_le_bytes());
        out.resize(HEADER_LEN, 0); // quantization parameters + padding

        for v in &self.values {
            match self.scalar {
                WeightScalar::F16 => {
                    out.extend_from_slice(&f16::from_f32(*v).to_le_bytes())
                }
                WeightScalar::F32 => out.extend_from_slice(&v.to_le_bytes()),
                WeightScalar::I16 => {
                    out.extend_from_slice(&(*v as i16).to_le_bytes())
                }
                WeightScalar::U8 => out.push(*v as u8),
            }
        }
        out
    }

    /// Writes this tensor to `path` in the on-disk layout.
    pub fn write_to(&self, path: &Path) -> Result<(), WeightError> {
        fs::write(path, self.encode()).map_err(|source| WeightError::Io {
            path: path.to_owned(),
            source,
        })
    }
}

/// Supplies per-tensor raw values from a directory of weight files.
#[derive(Clone, Debug)]
pub struct WeightStore {
    dir: PathBuf,
}

impl WeightStore {
    /// Creates a store rooted at the model directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The path holding the values of tensor `label`.
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.dat"))
    }

    /// Loads and decodes the weight tensor persisted under `label`.
    pub fn load(&self, label: &str) -> Result<WeightTensor, WeightError> {
        let path = self.path_for(label);
        let bytes = fs::read(&path).map_err(|source| WeightError::Io {
            path: path.clone(),
            source,
        })?;
        decode(&path, &bytes)
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<WeightTensor, WeightError> {
    if bytes.len() < HEADER_LEN {
        return Err(WeightError::Truncated {
            path: path.to_owned(),
            detail: format!("{} bytes, header needs {HEADER_LEN}", bytes.len()),
        });
    }

    let read_u32 = |offset: usize| {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };
    let read_u16 =
        |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

    // magic (2) + major (1) + minor (1)
    let data_len = read_u32(4) as usize;
    let rank = read_u32(8);
    if rank as usize > MAX_RANK {
        return Err(WeightError::BadRank {
            path: path.to_owned(),
            rank,
        });
    }
    let dims: Vec<usize> = (0..rank as usize)
        .map(|d| read_u32(12 + 4 * d) as usize)
        .collect();
    let bits = read_u32(12 + 4 * MAX_RANK);
    let vendor = read_u16(16 + 4 * MAX_RANK);
    if vendor != 0 {
        return Err(WeightError::UnknownVendor {
            path: path.to_owned(),
            vendor,
        });
    }
    let algorithm = read_u16(18 + 4 * MAX_RANK);
    let scalar = WeightScalar::from_header(path, algorithm, bits)?;

    let payload = &bytes[HEADER_LEN..];
    if payload.len() < data_len {
        return Err(WeightError::Truncated {
            path: path.to_owned(),
            detail: format!(
                "payload holds {} of {data_len} declared bytes",
                payload.len()
            ),
        });
    }

    let elem = scalar.byte_width();
    let values = payload[..data_len]
        .chunks_exact(elem)
        .map(|chunk| match scalar {
            WeightScalar::F16 => {
                f16::from_le_bytes([chunk[0], chunk[1]]).to_f32()
            }
            WeightScalar::F32 => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            }
            WeightScalar::I16 => {
                f32::from(i16::from_le_bytes([chunk[0], chunk[1]]))
            }
            WeightScalar::U8 => f32::from(chunk[0]),
        })
        .collect();

    Ok(WeightTensor {
        dims,
        scalar,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(label: &str, tensor: &WeightTensor) -> (tempfile::TempDir, WeightStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        tensor.write_to(&store.path_for(label)).unwrap();
        (dir, store)
    }

    #[test]
    fn f32_round_trip() {
        let tensor = WeightTensor {
            dims: vec![2, 1, 3, 3],
            scalar: WeightScalar::F32,
            values: (0..18).map(|i| i as f32 * 0.5 - 4.0).collect(),
        };
        let (_dir, store) = store_with("w", &tensor);
        let loaded = store.load("w").unwrap();
        assert_eq!(loaded, tensor);
    }

    #[test]
    fn f16_values_decode() {
        let tensor = WeightTensor {
            dims: vec![4],
            scalar: WeightScalar::F16,
            values: vec![0.5, -1.5, 2.0, 0.25],
        };
        let (_dir, store) = store_with("half", &tensor);
        let loaded = store.load("half").unwrap();
        assert_eq!(loaded.scalar, WeightScalar::F16);
        assert_eq!(loaded.values, tensor.values);
    }

    #[test]
    fn fixed_point_payloads() {
        let tensor = WeightTensor {
            dims: vec![3],
            scalar: WeightScalar::I16,
            values: vec![-300.0, 0.0, 512.0],
        };
        let (_dir, store) = store_with("q", &tensor);
        assert_eq!(store.load("q").unwrap().values, tensor.values);

        let bytes = WeightTensor {
            dims: vec![2],
            scalar: WeightScalar::U8,
            values: vec![0.0, 255.0],
        };
        let (_dir2, store2) = store_with("u", &bytes);
        assert_eq!(store2.load("u").unwrap().values, vec![0.0, 255.0]);
    }

    #[test]
    fn truncated_header_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        std::fs::write(store.path_for("short"), [0u8; 64]).unwrap();
        let err = store.load("short").unwrap_err();
        assert!(matches!(err, WeightError::Truncated { .. }));
    }

    #[test]
    fn truncated_payload_fails() {
        let tensor = WeightTensor {
            dims: vec![4],
            scalar: WeightScalar::F32,
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let mut bytes = tensor.encode();
        bytes.truncate(HEADER_LEN + 8); // half the payload
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        std::fs::write(store.path_for("cut"), &bytes).unwrap();
        let err = store.load("cut").unwrap_err();
        assert!(matches!(err, WeightError::Truncated { .. }));
    }

    #[test]
    fn unknown_vendor_fails() {
        let tensor = WeightTensor {
            dims: vec![1],
            scalar: WeightScalar::F32,
            values: vec![1.0],
        };
        let mut bytes = tensor.encode();
        // vendor id lives right after the bits-per-element word
        let vendor_at = 16 + 4 * MAX_RANK;
        bytes[vendor_at] = 7;
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        std::fs::write(store.path_for("v"), &bytes).unwrap();
        assert!(matches!(
            store.load("v").unwrap_err(),
            WeightError::UnknownVendor { vendor: 7, .. }
        ));
    }

    #[test]
    fn unsupported_algorithm_fails() {
        let tensor = WeightTensor {
            dims: vec![1],
            scalar: WeightScalar::F32,
            values: vec![1.0],
        };
        let mut bytes = tensor.encode();
        let algo_at = 18 + 4 * MAX_RANK;
        bytes[algo_at] = 2;
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        std::fs::write(store.path_for("a"), &bytes).unwrap();
        assert!(matches!(
            store.load("a").unwrap_err(),
            WeightError::UnsupportedFormat { algorithm: 2, .. }
        ));
    }

    #[test]
    fn bad_rank_fails() {
        let tensor = WeightTensor {
            dims: vec![1],
            scalar: WeightScalar::F32,
            values: vec![1.0],
        };
        let mut bytes = tensor.encode();
        bytes[8..12].copy_from_slice(&9u32.to_le_bytes());
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        std::fs::write(store.path_for("r"), &bytes).unwrap();
        assert!(matches!(
            store.load("r").unwrap_err(),
            WeightError::BadRank { rank: 9, .. }
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        assert!(matches!(
            store.load("absent").unwrap_err(),
            WeightError::Io { .. }
        ));
    }

    #[test]
    fn value_analysis_helpers() {
        let tensor = WeightTensor {
            dims: vec![4],
            scalar: WeightScalar::F32,
            values: vec![0.5, -3.0, 2.5, 1.0],
        };
        assert_eq!(tensor.max_abs(), 3.0);
        assert!(tensor.has_negative());

        let positive = WeightTensor {
            dims: vec![2],
            scalar: WeightScalar::F32,
            values: vec![0.5, 2.0],
        };
        assert!(!positive.has_negative());
    }
}
