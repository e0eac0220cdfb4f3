//! Element types supported by the VNA target.

use std::fmt;

/// A tensor element type as understood by the accelerator.
///
/// Fixed-point types carry their fractional precision out of band, in the
/// tensor's `fp_shift` field; the type itself only fixes width and
/// signedness.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ElementType {
    /// IEEE 16-bit floating point.
    Float16,
    /// IEEE 32-bit floating point.
    Float32,
    /// 4-bit signed fixed point.
    SFixed4,
    /// 8-bit signed fixed point.
    SFixed8,
    /// 16-bit signed fixed point.
    SFixed16,
    /// 4-bit unsigned fixed point.
    UFixed4,
    /// 8-bit unsigned fixed point.
    UFixed8,
    /// 16-bit unsigned fixed point.
    UFixed16,
}

impl ElementType {
    /// The enumerator name used by the target API.
    pub fn target_name(self) -> &'static str {
        match self {
            Self::Float16 => "VNA_Float16",
            Self::Float32 => "VNA_Float32",
            Self::SFixed4 => "VNA_SFixed4",
            Self::SFixed8 => "VNA_SFixed8",
            Self::SFixed16 => "VNA_SFixed16",
            Self::UFixed4 => "VNA_UFixed4",
            Self::UFixed8 => "VNA_UFixed8",
            Self::UFixed16 => "VNA_UFixed16",
        }
    }

    /// The C scalar type backing this element type on the host side.
    pub fn c_scalar(self) -> &'static str {
        match self {
            Self::Float16 => "half",
            Self::Float32 => "float",
            Self::SFixed4 => "int4_t",
            Self::SFixed8 => "int8_t",
            Self::SFixed16 => "int16_t",
            Self::UFixed4 => "uint4_t",
            Self::UFixed8 => "uint8_t",
            Self::UFixed16 => "uint16_t",
        }
    }

    /// `true` for the fixed-point types.
    pub fn is_fixed_point(self) -> bool {
        !matches!(self, Self::Float16 | Self::Float32)
    }

    /// Nominal width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::Float32 => 32,
            Self::Float16 | Self::SFixed16 | Self::UFixed16 => 16,
            Self::SFixed8 | Self::UFixed8 => 8,
            Self::SFixed4 | Self::UFixed4 => 4,
        }
    }

    /// Storage width in bytes. Sub-byte types occupy a full byte per
    /// element in the memory plan.
    pub fn byte_width(self) -> u64 {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::SFixed16 | Self::UFixed16 => 2,
            _ => 1,
        }
    }

    /// Parses a configuration-surface name (`"ufixed8"`, `"float32"`, ...).
    /// The target enumerator spelling is accepted as well.
    pub fn from_name(name: &str) -> Option<Self> {
        let all = [
            Self::Float16,
            Self::Float32,
            Self::SFixed4,
            Self::SFixed8,
            Self::SFixed16,
            Self::UFixed4,
            Self::UFixed8,
            Self::UFixed16,
        ];
        all.into_iter().find(|t| {
            t.target_name().eq_ignore_ascii_case(name)
                || t.target_name()["VNA_".len()..].eq_ignore_ascii_case(name)
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target_name())
    }
}
