//! Wire sample formats
//!
//! Samples live in memory and on disk as interleaved `[I, Q, I, Q, ...]`
//! primitives, so a channel buffer holding `n` complex samples is `2 * n` long.

use std::{fmt, str::FromStr};

use byte_slice_cast::{FromByteSlice, ToByteSlice, ToMutByteSlice};
use num_traits::NumCast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireFormat {
    /// Complex 16-bit fixed point
    Sc16,
    /// Complex 32-bit float
    Fc32,
}

impl WireFormat {
    /// Bytes occupied by one complex sample (both components)
    pub fn bytes_per_sample(self) -> usize {
        match self {
            WireFormat::Sc16 => 2 * std::mem::size_of::<i16>(),
            WireFormat::Fc32 => 2 * std::mem::size_of::<f32>(),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Sc16 => write!(f, "sc16"),
            WireFormat::Fc32 => write!(f, "fc32"),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sc16" => Ok(WireFormat::Sc16),
            "fc32" => Ok(WireFormat::Fc32),
            _ => Err(format!("unknown wire format '{s}' (expected sc16 or fc32)")),
        }
    }
}

/// One component of an interleaved complex sample
pub trait Sample:
    Copy + Default + NumCast + ToByteSlice + ToMutByteSlice + FromByteSlice + 'static
{
    const FORMAT: WireFormat;
}

impl Sample for i16 {
    const FORMAT: WireFormat = WireFormat::Sc16;
}

impl Sample for f32 {
    const FORMAT: WireFormat = WireFormat::Fc32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(WireFormat::Sc16.bytes_per_sample(), 4);
        assert_eq!(WireFormat::Fc32.bytes_per_sample(), 8);
        assert_eq!(<i16 as Sample>::FORMAT, WireFormat::Sc16);
        assert_eq!(<f32 as Sample>::FORMAT, WireFormat::Fc32);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("fc32".parse::<WireFormat>(), Ok(WireFormat::Fc32));
        assert!("sc8".parse::<WireFormat>().is_err());
    }
}
