use std::fmt::{self, Display};
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Node address of the local process.
pub const LOCAL_NODE: u16 = 0;

/// Wire type of a parameter. The discriminant is the on-wire type code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
    strum::FromRepr,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum ParamType {
    #[strum(to_string = "uint8", serialize = "u8")]
    Uint8 = 0,
    #[strum(to_string = "uint16", serialize = "u16")]
    Uint16 = 1,
    #[strum(to_string = "uint32", serialize = "u32")]
    Uint32 = 2,
    #[strum(to_string = "uint64", serialize = "u64")]
    Uint64 = 3,
    #[strum(to_string = "int8", serialize = "i8")]
    Int8 = 4,
    #[strum(to_string = "int16", serialize = "i16")]
    Int16 = 5,
    #[strum(to_string = "int32", serialize = "i32")]
    Int32 = 6,
    #[strum(to_string = "int64", serialize = "i64")]
    Int64 = 7,
    #[strum(to_string = "xint8", serialize = "x8")]
    Xint8 = 8,
    #[strum(to_string = "xint16", serialize = "x16")]
    Xint16 = 9,
    #[strum(to_string = "xint32", serialize = "x32")]
    Xint32 = 10,
    #[strum(to_string = "xint64", serialize = "x64")]
    Xint64 = 11,
    #[strum(to_string = "float", serialize = "f")]
    Float = 12,
    #[strum(to_string = "double", serialize = "d")]
    Double = 13,
    #[strum(to_string = "string", serialize = "str")]
    String = 14,
    #[strum(to_string = "data", serialize = "dat")]
    Data = 15,
}

impl ParamType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Self::from_repr(code).ok_or_else(|| Error::malformed(format!("unknown type code {code}")))
    }

    /// Bytes occupied by one array slot.
    pub fn element_size(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 | Self::Xint8 | Self::String | Self::Data => 1,
            Self::Uint16 | Self::Int16 | Self::Xint16 => 2,
            Self::Uint32 | Self::Int32 | Self::Xint32 | Self::Float => 4,
            Self::Uint64 | Self::Int64 | Self::Xint64 | Self::Double => 8,
        }
    }

    /// String and data parameters use their array length as a byte length.
    pub fn is_bytes(self) -> bool {
        matches!(self, Self::String | Self::Data)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Uint16
                | Self::Uint32
                | Self::Uint64
                | Self::Xint8
                | Self::Xint16
                | Self::Xint32
                | Self::Xint64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn is_hex(self) -> bool {
        matches!(self, Self::Xint8 | Self::Xint16 | Self::Xint32 | Self::Xint64)
    }
}

bitflags! {
    /// Access and classification flags of a parameter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamMask: u32 {
        const READONLY = 1 << 0;
        const REMOTE = 1 << 1;
        const CONF = 1 << 2;
        const TELEM = 1 << 3;
        const HWREG = 1 << 4;
        const ERRCNT = 1 << 5;
        const SYSINFO = 1 << 6;
        const SYSCONF = 1 << 7;
        const WDT = 1 << 8;
        const DEBUG = 1 << 9;
        const CALIB = 1 << 10;
        const ATOMIC_WRITE = 1 << 11;
        const PRIO1 = 1 << 14;
        const PRIO2 = 2 << 14;
        const PRIO3 = 3 << 14;
        const PRIO_MASK = 3 << 14;
    }
}

/// Letters used by mask strings, in print order.
const MASK_LETTERS: [(char, ParamMask); 12] = [
    ('r', ParamMask::READONLY),
    ('R', ParamMask::REMOTE),
    ('c', ParamMask::CONF),
    ('t', ParamMask::TELEM),
    ('h', ParamMask::HWREG),
    ('e', ParamMask::ERRCNT),
    ('i', ParamMask::SYSINFO),
    ('C', ParamMask::SYSCONF),
    ('w', ParamMask::WDT),
    ('d', ParamMask::DEBUG),
    ('o', ParamMask::ATOMIC_WRITE),
    ('q', ParamMask::CALIB),
];

impl ParamMask {
    /// Mask excluded from bulk pulls unless explicitly requested.
    pub const DEFAULT_EXCLUDE: Self = Self::REMOTE.union(Self::HWREG);

    /// Priority sub-field, 0 when unset.
    pub fn priority(self) -> u8 {
        ((self & Self::PRIO_MASK).bits() >> 14) as u8
    }

    /// Bulk-pull selection. An include mask with every bit set also selects
    /// parameters that carry no flags at all.
    pub fn matches(self, include: ParamMask, exclude: ParamMask) -> bool {
        (include.contains(Self::all()) || self.intersects(include)) && !self.intersects(exclude)
    }
}

impl FromStr for ParamMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mask = ParamMask::empty();
        for c in s.chars() {
            if c == '*' {
                return Ok(ParamMask::all());
            }
            mask |= match c {
                '1' => ParamMask::PRIO1,
                '2' => ParamMask::PRIO2,
                '3' => ParamMask::PRIO3,
                c => MASK_LETTERS
                    .iter()
                    .find(|(l, _)| *l == c)
                    .map(|(_, m)| *m)
                    .ok_or_else(|| Error::Config(format!("unknown mask letter '{c}'")))?,
            };
        }
        Ok(mask)
    }
}

impl Display for ParamMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, flag) in MASK_LETTERS {
            if self.contains(flag) {
                write!(f, "{letter}")?;
            }
        }
        match self.priority() {
            0 => Ok(()),
            p => write!(f, "{p}"),
        }
    }
}

/// Where a parameter's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    /// Volatile memory owned by the registry.
    #[default]
    Ram,
    /// Write-through to a vmem region at the given byte address.
    Vmem { region: u16, address: u32 },
    /// Cache of a parameter that lives on another node.
    Remote,
}

/// Identity of a parameter: unique per (node, id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub node: u16,
    pub id: u16,
}

impl ParamKey {
    pub fn new(node: u16, id: u16) -> Self {
        Self { node, id }
    }
}

impl Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node)
    }
}

/// Identifier accepted by registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamIdent {
    Name(String),
    Id(u16),
    Key(ParamKey),
}

impl From<&str> for ParamIdent {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for ParamIdent {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<u16> for ParamIdent {
    fn from(id: u16) -> Self {
        Self::Id(id)
    }
}

impl From<ParamKey> for ParamIdent {
    fn from(key: ParamKey) -> Self {
        Self::Key(key)
    }
}

impl Display for ParamIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Id(id) => write!(f, "id {id}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

/// Direction of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum QueueDirection {
    #[strum(serialize = "get")]
    Get,
    #[strum(serialize = "set")]
    Set,
}

/// Well-known parameter ids shared by most nodes.
pub mod well_known {
    pub const CSP_RTABLE: u16 = 12;
    pub const TFETCH_PRIMARY: u16 = 41;
    pub const TFETCH_SECONDARY: u16 = 42;
    pub const TFETCH_TIMEOUT: u16 = 43;
    pub const TFETCH_SYNCED: u16 = 44;
    pub const TFETCH_ERRORS: u16 = 45;
    pub const TFETCH_LAST: u16 = 46;
    pub const CSP_DEBUG: u16 = 50;
    pub const CRYPTO_KEY_PUBLIC: u16 = 150;
    pub const CRYPTO_KEY_SECRET: u16 = 151;
    pub const CRYPTO_KEY_REMOTE: u16 = 152;
    pub const CRYPTO_NONCE_RX: u16 = 153;
    pub const CRYPTO_NONCE_TX: u16 = 154;
    pub const CRYPTO_FAIL_AUTH_COUNT: u16 = 156;
    pub const CRYPTO_FAIL_NONCE_COUNT: u16 = 157;
    pub const COLLECTOR_CNFSTR: u16 = 200;
    pub const COLLECTOR_RUN: u16 = 201;
    pub const COLLECTOR_VERBOSE: u16 = 202;
    pub const TEST_ARRAY_PARAM: u16 = 1001;
    pub const TEST_STR: u16 = 1002;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_roundtrip() {
        use strum::IntoEnumIterator;
        for ty in ParamType::iter() {
            assert_eq!(ParamType::from_str(&ty.to_string()).unwrap(), ty);
            assert_eq!(ParamType::from_code(ty.code()).unwrap(), ty);
        }
        assert_eq!(ParamType::from_str("u8").unwrap(), ParamType::Uint8);
        assert!(ParamType::from_code(16).is_err());
    }

    #[test]
    fn test_mask_string() {
        let mask: ParamMask = "rt2".parse().unwrap();
        assert!(mask.contains(ParamMask::READONLY | ParamMask::TELEM));
        assert_eq!(mask.priority(), 2);
        assert_eq!(mask.to_string(), "rt2");
        assert_eq!("*".parse::<ParamMask>().unwrap(), ParamMask::all());
        assert!("z".parse::<ParamMask>().is_err());
    }

    #[test]
    fn test_default_exclude() {
        let telem = ParamMask::TELEM;
        assert!(telem.matches(ParamMask::all(), ParamMask::DEFAULT_EXCLUDE));
        let hw = ParamMask::TELEM | ParamMask::HWREG;
        assert!(!hw.matches(ParamMask::all(), ParamMask::DEFAULT_EXCLUDE));
        assert!(ParamMask::empty().matches(ParamMask::all(), ParamMask::DEFAULT_EXCLUDE));
        assert!(!ParamMask::empty().matches(ParamMask::TELEM, ParamMask::empty()));
    }
}
