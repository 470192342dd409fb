//! The PakBus binary type system.
//!
//! Every value that crosses the wire is described by one of the named
//! data types in [`DataType`](DataType). Message bodies, table
//! definitions and collected records are all decoded by walking a list
//! of these types over a byte buffer; the list itself is supplied by
//! the caller (a fixed message layout, or a table definition learned
//! from the device at runtime).

use std::convert::TryInto;
use std::fmt;

use bitmatch::bitmatch;
use chrono::NaiveDateTime;

use crate::error::{Error, Result};

/// Seconds between the Unix epoch and the PakBus epoch,
/// 1990-01-01 00:00:00 UTC.
pub const PAKBUS_EPOCH: i64 = 631_152_000;

/// An 8-byte PakBus timestamp: seconds and nanoseconds since
/// 1990-01-01 00:00:00 UTC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NSec {
    /// Whole seconds since the PakBus epoch.
    pub sec: i32,

    /// Nanoseconds into the second. Values of a whole second or more
    /// carry over when converting to a datetime.
    pub nsec: i32,
}

impl NSec {
    pub fn new(sec: i32, nsec: i32) -> Self {
        NSec { sec, nsec }
    }

    /// Converts to a wall-clock datetime, truncated to whole seconds.
    /// `None` if the value is outside the representable range.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        let secs = PAKBUS_EPOCH + i64::from(self.sec) + i64::from(self.nsec) / 1_000_000_000;
        chrono::DateTime::from_timestamp(secs, 0).map(|t| t.naive_utc())
    }

    /// Converts a wall-clock datetime into a timestamp, discarding
    /// sub-second precision.
    pub fn from_datetime(time: NaiveDateTime) -> Self {
        NSec {
            sec: (time.and_utc().timestamp() - PAKBUS_EPOCH) as i32,
            nsec: 0,
        }
    }
}

impl fmt::Display for NSec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_datetime() {
            Some(time) => write!(f, "{}", time),
            None => write!(f, "({}, {})", self.sec, self.nsec),
        }
    }
}

/// The named data types of the PakBus type table.
///
/// Each variant carries a wire code (used by table definitions to
/// describe their columns) and a fixed size, except for the two string
/// types whose length is determined by a terminator (`ASCIIZ`) or by
/// the caller (`ASCII`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    Byte,
    UInt2,
    UInt4,
    Int1,
    Int2,
    Int4,
    /// 16-bit packed float: sign, two exponent bits, 13-bit mantissa.
    FP2,
    /// 24-bit packed float, kept as raw bytes.
    FP3,
    /// 32-bit packed float, kept as raw bytes.
    FP4,
    IEEE4B,
    IEEE8B,
    Bool8,
    Bool,
    Bool2,
    Bool4,
    /// Seconds since the PakBus epoch, big-endian.
    Sec,
    /// Six-byte microsecond counter, kept as raw bytes.
    USec,
    /// Seconds/nanoseconds pair since the PakBus epoch, big-endian.
    NSec,
    /// Fixed-length string; the length comes from the caller.
    ASCII,
    /// NUL-terminated string.
    ASCIIZ,
    Short,
    Long,
    UShort,
    ULong,
    IEEE4L,
    IEEE8L,
    /// Little-endian variant of `NSec`.
    SecNano,
}

impl DataType {
    /// Resolves a type table code, as found in `.TDF` field
    /// definitions.
    pub fn from_code(code: u8) -> Option<DataType> {
        use DataType::*;
        Some(match code {
            1 => Byte,
            2 => UInt2,
            3 => UInt4,
            4 => Int1,
            5 => Int2,
            6 => Int4,
            7 => FP2,
            8 => FP4,
            9 => IEEE4B,
            10 => Bool,
            11 => ASCII,
            12 => Sec,
            13 => USec,
            14 => NSec,
            15 => FP3,
            16 => ASCIIZ,
            17 => Bool8,
            18 => IEEE8B,
            19 => Short,
            20 => Long,
            21 => UShort,
            22 => ULong,
            23 => SecNano,
            24 => IEEE4L,
            25 => IEEE8L,
            27 => Bool2,
            28 => Bool4,
            _ => return None,
        })
    }

    /// The wire code of this type.
    pub fn code(self) -> u8 {
        use DataType::*;
        match self {
            Byte => 1,
            UInt2 => 2,
            UInt4 => 3,
            Int1 => 4,
            Int2 => 5,
            Int4 => 6,
            FP2 => 7,
            FP4 => 8,
            IEEE4B => 9,
            Bool => 10,
            ASCII => 11,
            Sec => 12,
            USec => 13,
            NSec => 14,
            FP3 => 15,
            ASCIIZ => 16,
            Bool8 => 17,
            IEEE8B => 18,
            Short => 19,
            Long => 20,
            UShort => 21,
            ULong => 22,
            SecNano => 23,
            IEEE4L => 24,
            IEEE8L => 25,
            Bool2 => 27,
            Bool4 => 28,
        }
    }

    /// Fixed wire size in bytes, or `None` for the string types.
    pub fn size(self) -> Option<usize> {
        use DataType::*;
        match self {
            Byte | Int1 | Bool | Bool8 => Some(1),
            UInt2 | Int2 | FP2 | Short | UShort | Bool2 => Some(2),
            FP3 => Some(3),
            UInt4 | Int4 | FP4 | IEEE4B | IEEE4L | Sec | Long | ULong | Bool4 => Some(4),
            USec => Some(6),
            NSec | SecNano | IEEE8B | IEEE8L => Some(8),
            ASCII | ASCIIZ => None,
        }
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    NSec(NSec),
    /// Every element of a multi-dimensional field. Only produced with
    /// the `arrays` cargo feature enabled.
    Array(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Bytes(v) => {
                for (i, b) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
            Value::NSec(v) => write!(f, "{}", v),
            Value::Array(v) => {
                for (i, e) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

/// Sequential reader over a response buffer.
///
/// Every `pop_*` call consumes the bytes of exactly one value and
/// fails with [`Error::BadData`](Error::BadData) on a short buffer; a
/// truncated response is never zero-filled.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Offset of the next unread byte.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the buffer, consumed.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::BadData(format!(
                "buffer truncated: wanted {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| {
            Error::BadData(format!("buffer truncated: wanted 1 byte at offset {}", self.pos))
        })
    }

    pub fn pop_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn pop_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn pop_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn pop_i32_be(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn pop_nsec(&mut self) -> Result<NSec> {
        let sec = self.pop_i32_be()?;
        let nsec = self.pop_i32_be()?;
        Ok(NSec { sec, nsec })
    }

    /// Consumes bytes up to and including the next NUL and returns the
    /// string before it. Without a terminator the rest of the buffer is
    /// taken, matching how loggers end their last directory entry.
    pub fn pop_asciiz(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let value = match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.pos += nul + 1;
                &rest[..nul]
            }
            None => {
                self.pos = self.buf.len();
                rest
            }
        };
        Ok(String::from_utf8_lossy(value).into_owned())
    }

    /// Consumes exactly `len` bytes of fixed-length string.
    pub fn pop_ascii(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    /// Decodes one value of type `ty`. `len` is only consulted for
    /// `ASCII` (where it is the field dimension).
    pub fn pop_value(&mut self, ty: DataType, len: usize) -> Result<Value> {
        use DataType::*;
        Ok(match ty {
            Byte | Bool | Bool8 => Value::U8(self.pop_u8()?),
            UInt2 | Bool2 => Value::U16(self.pop_u16_be()?),
            UInt4 | Bool4 => Value::U32(self.pop_u32_be()?),
            Int1 => Value::I8(self.pop_u8()? as i8),
            Int2 => Value::I16(i16::from_be_bytes(self.take(2)?.try_into().unwrap())),
            Int4 | Sec => Value::I32(self.pop_i32_be()?),
            FP2 => Value::F32(decode_fp2(self.pop_u16_be()?)),
            FP3 => Value::Bytes(self.take(3)?.to_vec()),
            FP4 => Value::Bytes(self.take(4)?.to_vec()),
            USec => Value::Bytes(self.take(6)?.to_vec()),
            IEEE4B => Value::F32(f32::from_be_bytes(self.take(4)?.try_into().unwrap())),
            IEEE4L => Value::F32(f32::from_le_bytes(self.take(4)?.try_into().unwrap())),
            IEEE8B => Value::F64(f64::from_be_bytes(self.take(8)?.try_into().unwrap())),
            IEEE8L => Value::F64(f64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            Short => Value::I16(i16::from_le_bytes(self.take(2)?.try_into().unwrap())),
            Long => Value::I32(i32::from_le_bytes(self.take(4)?.try_into().unwrap())),
            UShort => Value::U16(u16::from_le_bytes(self.take(2)?.try_into().unwrap())),
            ULong => Value::U32(u32::from_le_bytes(self.take(4)?.try_into().unwrap())),
            NSec => Value::NSec(self.pop_nsec()?),
            SecNano => {
                let sec = i32::from_le_bytes(self.take(4)?.try_into().unwrap());
                let nsec = i32::from_le_bytes(self.take(4)?.try_into().unwrap());
                Value::NSec(crate::types::NSec { sec, nsec })
            }
            ASCII => Value::Str(self.pop_ascii(len)?),
            ASCIIZ => Value::Str(self.pop_asciiz()?),
        })
    }
}

/// Decodes a 16-bit packed float. Bits 0-12 hold the mantissa, bits
/// 13-14 a base-ten exponent, bit 15 the sign.
#[bitmatch]
pub fn decode_fp2(raw: u16) -> f32 {
    #[bitmatch]
    let "seem_mmmm_mmmm_mmmm" = raw;
    let value = f32::from(m) / 10f32.powi(i32::from(e));
    if s == 1 {
        -value
    } else {
        value
    }
}

/// Sequential writer for command bodies.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16_be(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32_be(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_nsec(&mut self, v: NSec) -> &mut Self {
        self.buf.extend_from_slice(&v.sec.to_be_bytes());
        self.buf.extend_from_slice(&v.nsec.to_be_bytes());
        self
    }

    /// Appends the string bytes followed by the NUL terminator.
    pub fn put_asciiz(&mut self, v: &str) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        self
    }

    /// Appends a fixed-length string without a terminator.
    pub fn put_ascii(&mut self, v: &str) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp2_layout() {
        // mantissa only
        assert_eq!(decode_fp2(0x09CA), 2506.0);
        // exponent scales by powers of ten
        assert!((decode_fp2(0x4551) - 13.61).abs() < 1e-4);
        // sign bit
        assert!((decode_fp2(0xA7E0) + 201.6).abs() < 1e-4);
        assert_eq!(decode_fp2(0x0000), 0.0);
    }

    #[test]
    fn nsec_datetime_round_trip() {
        let nsec = NSec::new(712_143_626, 990_000_000);
        let time = nsec.to_datetime().unwrap();
        assert_eq!(time.to_string(), "2012-07-26 09:40:26");
        // sub-second precision is discarded on both conversions
        assert_eq!(NSec::from_datetime(time), NSec::new(712_143_626, 0));
    }

    #[test]
    fn nsec_epoch() {
        assert_eq!(
            NSec::new(0, 0).to_datetime().unwrap().to_string(),
            "1990-01-01 00:00:00"
        );
    }

    #[test]
    fn scalar_round_trips() {
        let mut w = Writer::new();
        w.put_u8(0x7F)
            .put_u16_be(0xBEEF)
            .put_u32_be(0xDEAD_BEEF)
            .put_nsec(NSec::new(-5, 250))
            .put_asciiz("CPU:prog.cr1")
            .put_ascii("abcd");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.pop_value(DataType::Byte, 1).unwrap(), Value::U8(0x7F));
        assert_eq!(r.pop_value(DataType::UInt2, 1).unwrap(), Value::U16(0xBEEF));
        assert_eq!(
            r.pop_value(DataType::UInt4, 1).unwrap(),
            Value::U32(0xDEAD_BEEF)
        );
        assert_eq!(
            r.pop_value(DataType::NSec, 1).unwrap(),
            Value::NSec(NSec::new(-5, 250))
        );
        assert_eq!(
            r.pop_value(DataType::ASCIIZ, 1).unwrap(),
            Value::Str("CPU:prog.cr1".into())
        );
        assert_eq!(
            r.pop_value(DataType::ASCII, 4).unwrap(),
            Value::Str("abcd".into())
        );
        assert!(r.is_empty());
    }

    #[test]
    fn signed_integers_and_bools() {
        let bytes = [
            0xFF, // Int1 -1
            0xFF, 0xFE, // Int2 -2
            0xFF, 0xFF, 0xFF, 0xFD, // Int4 -3
            0x05, // Bool8, width one byte
            0xFF, 0xFF, 0xFF, 0x00, // Sec
        ];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.pop_value(DataType::Int1, 1).unwrap(), Value::I8(-1));
        assert_eq!(r.pop_value(DataType::Int2, 1).unwrap(), Value::I16(-2));
        assert_eq!(r.pop_value(DataType::Int4, 1).unwrap(), Value::I32(-3));
        assert_eq!(r.pop_value(DataType::Bool8, 1).unwrap(), Value::U8(5));
        assert_eq!(r.pop_value(DataType::Sec, 1).unwrap(), Value::I32(-256));
    }

    #[test]
    fn little_endian_variants() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0x00, 0x00];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.pop_value(DataType::UShort, 1).unwrap(), Value::U16(0x1234));
        assert_eq!(r.pop_value(DataType::Short, 1).unwrap(), Value::I16(0x5678));
    }

    #[test]
    fn ieee_floats() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&13.5f32.to_be_bytes());
        bytes.extend_from_slice(&13.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.25f64).to_be_bytes());
        bytes.extend_from_slice(&(-2.25f64).to_le_bytes());
        let mut r = Reader::new(&bytes);
        assert_eq!(r.pop_value(DataType::IEEE4B, 1).unwrap(), Value::F32(13.5));
        assert_eq!(r.pop_value(DataType::IEEE4L, 1).unwrap(), Value::F32(13.5));
        assert_eq!(r.pop_value(DataType::IEEE8B, 1).unwrap(), Value::F64(-2.25));
        assert_eq!(r.pop_value(DataType::IEEE8L, 1).unwrap(), Value::F64(-2.25));
    }

    #[test]
    fn asciiz_without_terminator_takes_rest() {
        let mut r = Reader::new(b"tail");
        assert_eq!(r.pop_asciiz().unwrap(), "tail");
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut r = Reader::new(&[0x01]);
        assert!(r.pop_value(DataType::UInt4, 1).is_err());
    }

    #[test]
    fn type_codes_round_trip() {
        for code in 0..=0xFF {
            if let Some(ty) = DataType::from_code(code) {
                assert_eq!(ty.code(), code);
            }
        }
    }
}
