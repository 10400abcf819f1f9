// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`Guid`] type with the same layout as the Windows type `GUID`, used for
//! channel interface and instance identifiers.

use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Windows format GUID.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Default for Guid {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// An error parsing a GUID string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid GUID length")]
    Length,
    #[error("invalid GUID format")]
    Format,
    #[error("invalid GUID digit")]
    Digit,
}

macro_rules! hex_helper {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Err(ParseError::Digit),
        }
    };
}

const fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

const fn hex_value(value: &[u8], offset: usize, digits: usize) -> Option<u64> {
    let mut result = 0u64;
    let mut i = 0;
    while i < digits {
        let d = match hex_digit(value[offset + i]) {
            Some(d) => d,
            None => return None,
        };
        result = (result << 4) | d as u64;
        i += 1;
    }
    Some(result)
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Creates a GUID from a string at compile time, panicking if the input is
    /// invalid. Accepts "{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}" with or
    /// without braces.
    pub const fn from_static_str(value: &'static str) -> Guid {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("Invalid GUID length."),
            Err(ParseError::Format) => panic!("Invalid GUID format."),
            Err(ParseError::Digit) => panic!("Invalid GUID digit."),
        }
    }

    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let offset = if value.len() == 38 {
            if value[0] != b'{' || value[37] != b'}' {
                return Err(ParseError::Format);
            }
            1
        } else if value.len() == 36 {
            0
        } else {
            return Err(ParseError::Length);
        };

        if value[offset + 8] != b'-'
            || value[offset + 13] != b'-'
            || value[offset + 18] != b'-'
            || value[offset + 23] != b'-'
        {
            return Err(ParseError::Format);
        }

        let mut data4 = [0u8; 8];
        // The first two bytes precede the last dash.
        let positions = [19, 21, 24, 26, 28, 30, 32, 34];
        let mut i = 0;
        while i < 8 {
            data4[i] = hex_helper!(hex_value(value, offset + positions[i], 2)) as u8;
            i += 1;
        }

        Ok(Guid {
            data1: hex_helper!(hex_value(value, offset, 8)) as u32,
            data2: hex_helper!(hex_value(value, offset + 9, 4)) as u16,
            data3: hex_helper!(hex_value(value, offset + 14, 4)) as u16,
            data4,
        })
    }

    /// Returns true if this is the all-zero GUID.
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;
    use super::ParseError;
    use zerocopy::IntoBytes;

    #[test]
    fn test_parse_and_display() {
        const KEYBOARD: Guid = Guid::from_static_str("f912ad6d-2b17-48ea-bd65-f927a61c7684");
        assert_eq!(KEYBOARD.data1, 0xf912ad6d);
        assert_eq!(KEYBOARD.data2, 0x2b17);
        assert_eq!(KEYBOARD.data3, 0x48ea);
        assert_eq!(KEYBOARD.data4, [0xbd, 0x65, 0xf9, 0x27, 0xa6, 0x1c, 0x76, 0x84]);
        assert_eq!(KEYBOARD.to_string(), "f912ad6d-2b17-48ea-bd65-f927a61c7684");

        let braced: Guid = "{F912AD6D-2B17-48EA-BD65-F927A61C7684}".parse().unwrap();
        assert_eq!(braced, KEYBOARD);
    }

    #[test]
    fn test_wire_layout() {
        let guid = Guid::from_static_str("00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert_eq!(
            guid.as_bytes(),
            &[3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("1234".parse::<Guid>(), Err(ParseError::Length));
        assert_eq!(
            "f912ad6d+2b17-48ea-bd65-f927a61c7684".parse::<Guid>(),
            Err(ParseError::Format)
        );
        assert_eq!(
            "g912ad6d-2b17-48ea-bd65-f927a61c7684".parse::<Guid>(),
            Err(ParseError::Digit)
        );
        assert!(Guid::default().is_zero());
    }
}
