use serde::Deserialize;
use thiserror::Error;

/// Value types a meter register can hold. The serde names ("Int16",
/// "UInt32", "Float32") are exactly what device templates declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RegisterType {
    Int16,
    UInt32,
    Float32,
}

impl RegisterType {
    /// Number of 16-bit register words this type occupies on the wire.
    pub fn word_count(&self) -> u16 {
        match self {
            RegisterType::Int16 => 1,
            RegisterType::UInt32 => 2,
            RegisterType::Float32 => 2,
        }
    }
}

/// Word order used when two consecutive registers form a 32-bit value.
/// Templates that leave it out get LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Endianness {
    #[default]
    LE,
    BE,
}

/// A decoded register value. Int16 registers come back as the raw unsigned
/// word: the decode path performs no sign extension, and the variant name
/// keeps that visible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    UInt16(u16),
    UInt32(u32),
    Float32(f32),
}

impl RegisterValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            RegisterValue::UInt16(w) => f64::from(w),
            RegisterValue::UInt32(v) => f64::from(v),
            RegisterValue::Float32(f) => f64::from(f),
        }
    }
}

impl From<RegisterValue> for serde_json::Value {
    fn from(value: RegisterValue) -> Self {
        match value {
            RegisterValue::UInt16(w) => w.into(),
            RegisterValue::UInt32(v) => v.into(),
            RegisterValue::Float32(f) => f.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{reg_type:?} needs {needed} register words, got {got}")]
    NotEnoughWords {
        reg_type: RegisterType,
        needed: usize,
        got: usize,
    },
}

/// Decode raw register words into a typed value.
///
/// Int16 returns `words[0]` untouched. The 32-bit types combine two words:
/// with LE word order `words[0]` is the low half, with BE the high half.
/// Float32 reinterprets the combined bits as IEEE-754 single precision.
/// Words beyond what the type needs are ignored.
pub fn decode(
    words: &[u16],
    reg_type: RegisterType,
    endianness: Endianness,
) -> Result<RegisterValue, DecodeError> {
    let needed = reg_type.word_count() as usize;
    if words.len() < needed {
        return Err(DecodeError::NotEnoughWords {
            reg_type,
            needed,
            got: words.len(),
        });
    }

    match reg_type {
        RegisterType::Int16 => Ok(RegisterValue::UInt16(words[0])),
        RegisterType::UInt32 => Ok(RegisterValue::UInt32(pack(words[0], words[1], endianness))),
        RegisterType::Float32 => Ok(RegisterValue::Float32(f32::from_bits(pack(
            words[0], words[1], endianness,
        )))),
    }
}

/// Inverse of [`decode`]. Used by the tests and by anything emulating
/// a meter.
pub fn encode(value: RegisterValue, endianness: Endianness) -> Vec<u16> {
    match value {
        RegisterValue::UInt16(w) => vec![w],
        RegisterValue::UInt32(v) => unpack(v, endianness),
        RegisterValue::Float32(f) => unpack(f.to_bits(), endianness),
    }
}

fn pack(w0: u16, w1: u16, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::LE => (u32::from(w1) << 16) | u32::from(w0),
        Endianness::BE => (u32::from(w0) << 16) | u32::from(w1),
    }
}

fn unpack(raw: u32, endianness: Endianness) -> Vec<u16> {
    let hi = (raw >> 16) as u16;
    let lo = (raw & 0xFFFF) as u16;
    match endianness {
        Endianness::LE => vec![lo, hi],
        Endianness::BE => vec![hi, lo],
    }
}
