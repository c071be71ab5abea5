//! Text vector sub-format used inside command arguments.
//!
//! A vector travels as a single ASCII argument `[c0,c1,...,cN]`:
//!
//! - binary vectors render each component as `0` or `1`;
//! - dense vectors render each component with exactly six fractional digits
//!   (`0.250000`, `-3.000000`).
//!
//! Decoding infers the numeric type for the *whole* vector: it is integer
//! valued only when every component is a non-empty run of ASCII digits.
//! A single sign or decimal point anywhere switches every component to
//! floating point, so `[-3,5]` decodes as `[-3.0, 5.0]`, not as integers.
//! Servers and other clients depend on this rule; do not "fix" it.
//!
//! Components are parsed strictly: surrounding whitespace (`[ 1.5]`) is a
//! parse error, and an all-digit component must fit in an `i64`.

use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;

use crate::transport::Arg;

/// Errors from encoding or decoding the text vector format.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("invalid text vector value: expected `[...]`")]
    MalformedVector,

    #[error("cannot parse vector component {index}: {component:?}")]
    ComponentParse { index: usize, component: String },

    #[error("invalid vector component {index}: {value}")]
    InvalidComponent { index: usize, value: f64 },
}

/// A query or stored vector, tagged dense or binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector {
    components: Vec<f64>,
    binary: bool,
}

impl Vector {
    pub fn new(components: Vec<f64>, binary: bool) -> Self {
        Self { components, binary }
    }

    pub fn dense(components: impl Into<Vec<f64>>) -> Self {
        Self {
            components: components.into(),
            binary: false,
        }
    }

    /// Binary vector; components are validated on [`Vector::encode`].
    pub fn binary(bits: impl IntoIterator<Item = u8>) -> Self {
        Self {
            components: bits.into_iter().map(f64::from).collect(),
            binary: true,
        }
    }

    pub fn components(&self) -> &[f64] {
        &self.components
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn dimension(&self) -> usize {
        self.components.len()
    }

    pub fn encode(&self) -> Result<EncodedVector, CodecError> {
        encode(&self.components, self.binary)
    }
}

/// The ASCII wire form of a vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedVector(String);

impl EncodedVector {
    /// Wrap text that is already in wire form (e.g. read from a config file
    /// or a previous reply). The text is not validated.
    pub fn from_wire(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for EncodedVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<EncodedVector> for Arg {
    fn from(value: EncodedVector) -> Self {
        Arg::from(value.0)
    }
}

impl From<&EncodedVector> for Arg {
    fn from(value: &EncodedVector) -> Self {
        Arg::from(value.as_str())
    }
}

/// Result of [`decode`]: every component is an integer, or every component
/// is a float.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedVector {
    Integer(Vec<i64>),
    Float(Vec<f64>),
}

impl DecodedVector {
    pub fn len(&self) -> usize {
        match self {
            DecodedVector::Integer(v) => v.len(),
            DecodedVector::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DecodedVector::Integer(_))
    }

    /// Components widened to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            DecodedVector::Integer(v) => v.iter().map(|&x| x as f64).collect(),
            DecodedVector::Float(v) => v.clone(),
        }
    }
}

/// Encode components into the text vector format.
///
/// Binary mode accepts only `0` and `1`. Dense mode rejects NaN and
/// infinities, which have no representation in the format.
pub fn encode(components: &[f64], binary: bool) -> Result<EncodedVector, CodecError> {
    let mut out = String::with_capacity(2 + components.len() * if binary { 2 } else { 10 });
    out.push('[');
    for (index, &value) in components.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        if binary {
            let bit = if value == 0.0 {
                '0'
            } else if value == 1.0 {
                '1'
            } else {
                return Err(CodecError::InvalidComponent { index, value });
            };
            out.push(bit);
        } else {
            if !value.is_finite() {
                return Err(CodecError::InvalidComponent { index, value });
            }
            // Writing to a String cannot fail.
            let _ = write!(out, "{:.6}", value);
        }
    }
    out.push(']');
    Ok(EncodedVector(out))
}

/// Decode a text vector, inferring integer or float components.
pub fn decode(buf: &[u8]) -> Result<DecodedVector, CodecError> {
    let (Some(b'['), Some(b']')) = (buf.first(), buf.last()) else {
        return Err(CodecError::MalformedVector);
    };

    let components: Vec<&[u8]> = buf[1..buf.len() - 1].split(|&b| b == b',').collect();
    let all_digits = components
        .iter()
        .all(|c| !c.is_empty() && c.iter().all(u8::is_ascii_digit));

    if all_digits {
        components
            .iter()
            .enumerate()
            .map(|(index, c)| parse_component::<i64>(index, c))
            .collect::<Result<Vec<_>, _>>()
            .map(DecodedVector::Integer)
    } else {
        components
            .iter()
            .enumerate()
            .map(|(index, c)| parse_component::<f64>(index, c))
            .collect::<Result<Vec<_>, _>>()
            .map(DecodedVector::Float)
    }
}

fn parse_component<N: std::str::FromStr>(index: usize, raw: &[u8]) -> Result<N, CodecError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<N>().ok())
        .ok_or_else(|| CodecError::ComponentParse {
            index,
            component: String::from_utf8_lossy(raw).into_owned(),
        })
}
