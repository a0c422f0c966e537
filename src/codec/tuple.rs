use std::io::{Read, Write};

use crate::codec::RecordCodec;
use crate::core::SpillError;

const NULL: u8 = 1;
const INTEGER: u8 = 10;
const LONG: u8 = 15;
const DOUBLE: u8 = 25;
const CHARARRAY: u8 = 55;
const TUPLE: u8 = 110;

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    CharArray(String),
}

impl Datum {
    /// Numeric view used by checksum-style tests and the stress harness.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int(v) => Some(*v as i64),
            Datum::Long(v) => Some(*v),
            _ => None,
        }
    }
}

pub type Tuple = Vec<Datum>;

/// Reference record codec: every tuple and every field is preceded by its
/// type tag, integers are little-endian, strings are length-prefixed UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleCodec;

impl RecordCodec for TupleCodec {
    type Record = Tuple;

    fn write<W: Write>(&self, out: &mut W, record: &Tuple) -> Result<(), SpillError> {
        out.write_all(&[TUPLE])?;
        out.write_all(&(record.len() as u32).to_le_bytes())?;
        for datum in record {
            match datum {
                Datum::Null => out.write_all(&[NULL])?,
                Datum::Int(v) => {
                    out.write_all(&[INTEGER])?;
                    out.write_all(&v.to_le_bytes())?;
                }
                Datum::Long(v) => {
                    out.write_all(&[LONG])?;
                    out.write_all(&v.to_le_bytes())?;
                }
                Datum::Double(v) => {
                    out.write_all(&[DOUBLE])?;
                    out.write_all(&v.to_le_bytes())?;
                }
                Datum::CharArray(s) => {
                    out.write_all(&[CHARARRAY])?;
                    out.write_all(&(s.len() as u32).to_le_bytes())?;
                    out.write_all(s.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    fn read<R: Read>(&self, input: &mut R) -> Result<Tuple, SpillError> {
        let tag = read_array::<1, _>(input)?[0];
        if tag != TUPLE {
            return Err(SpillError::CodecError(format!(
                "expected tuple tag {TUPLE}, got {tag}"
            )));
        }
        let arity = u32::from_le_bytes(read_array(input)?) as usize;
        let mut tuple = Vec::with_capacity(arity);
        for _ in 0..arity {
            let datum = match read_array::<1, _>(input)?[0] {
                NULL => Datum::Null,
                INTEGER => Datum::Int(i32::from_le_bytes(read_array(input)?)),
                LONG => Datum::Long(i64::from_le_bytes(read_array(input)?)),
                DOUBLE => Datum::Double(f64::from_le_bytes(read_array(input)?)),
                CHARARRAY => {
                    let len = u32::from_le_bytes(read_array(input)?) as usize;
                    let mut bytes = vec![0u8; len];
                    input.read_exact(&mut bytes)?;
                    Datum::CharArray(
                        String::from_utf8(bytes)
                            .map_err(|e| SpillError::CodecError(e.to_string()))?,
                    )
                }
                other => {
                    return Err(SpillError::CodecError(format!(
                        "unknown datum tag {other}"
                    )));
                }
            };
            tuple.push(datum);
        }
        Ok(tuple)
    }

    fn memory_size(&self, record: &Tuple) -> usize {
        let strings: usize = record
            .iter()
            .map(|d| match d {
                Datum::CharArray(s) => s.capacity(),
                _ => 0,
            })
            .sum();
        std::mem::size_of::<Tuple>() + record.capacity() * std::mem::size_of::<Datum>() + strings
    }
}

fn read_array<const N: usize, R: Read>(input: &mut R) -> Result<[u8; N], SpillError> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tuple {
        vec![
            Datum::Int(-3),
            Datum::Long(1 << 40),
            Datum::Null,
            Datum::Double(2.5),
            Datum::CharArray("héllo".to_string()),
        ]
    }

    #[test]
    fn test_round_trip_mixed_fields() {
        let mut buf = Vec::new();
        TupleCodec.write(&mut buf, &sample()).unwrap();
        assert_eq!(buf[0], TUPLE);

        let decoded = TupleCodec.read(&mut &buf[..]).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_unknown_datum_tag() {
        let buf = [TUPLE, 1, 0, 0, 0, 99];
        let err = TupleCodec.read(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains("unknown datum tag 99"));
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let buf = [TUPLE, 2, 0, 0, 0, INTEGER, 1];
        let err = TupleCodec.read(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, SpillError::IoError(_)));
    }

    #[test]
    fn test_memory_size_counts_strings() {
        let small = vec![Datum::Int(1)];
        let large = vec![Datum::CharArray("x".repeat(1024))];
        assert!(TupleCodec.memory_size(&large) > TupleCodec.memory_size(&small) + 1000);
    }
}
