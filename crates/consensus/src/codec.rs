//! Canonical binary encoding.
//!
//! Little-endian integers, var-int length prefixes and strict decoding:
//! every read is bounds-checked and decoders must consume their whole
//! input.

use crate::{ConsensusError, ConsensusResult};

/// Objects with a canonical byte encoding.
pub trait Serializable {
    /// The size of the object in bytes after serialization.
    fn size(&self) -> usize;

    /// Serializes the object using the specified writer.
    fn serialize(&self, writer: &mut BinaryWriter);

    /// Deserializes the object using the specified reader.
    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self>
    where
        Self: Sized;
}

/// Extension methods for serializable objects.
pub trait SerializableExt: Serializable {
    /// Converts the object to a byte array.
    fn to_array(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        self.serialize(&mut writer);
        writer.into_bytes()
    }

    /// Creates an object from a byte array, rejecting trailing bytes.
    fn from_array(data: &[u8]) -> ConsensusResult<Self>
    where
        Self: Sized,
    {
        let mut reader = MemoryReader::new(data);
        let value = Self::deserialize(&mut reader)?;
        reader.ensure_consumed()?;
        Ok(value)
    }
}

impl<T: Serializable> SerializableExt for T {}

/// Gets the size of a variable-length integer.
pub fn get_var_size(value: u64) -> usize {
    if value < 0xFD {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Append-only byte sink.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buffer: Vec<u8>,
}

impl BinaryWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_var_int(&mut self, value: u64) {
        if value < 0xFD {
            self.write_u8(value as u8);
        } else if value <= 0xFFFF {
            self.write_u8(0xFD);
            self.buffer.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= 0xFFFF_FFFF {
            self.write_u8(0xFE);
            self.write_u32(value as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64(value);
        }
    }

    /// Writes a var-int length prefix followed by the bytes.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_int(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    /// `0x00` for `None`, `0x01` followed by the value for `Some`.
    pub fn write_optional_u32(&mut self, value: Option<u32>) {
        match value {
            Some(v) => {
                self.write_u8(1);
                self.write_u32(v);
            }
            None => self.write_u8(0),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked cursor over a byte slice.
#[derive(Debug)]
pub struct MemoryReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> MemoryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Fails unless every byte has been consumed.
    pub fn ensure_consumed(&self) -> ConsensusResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ConsensusError::malformed(format!("{} trailing bytes", n))),
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> ConsensusResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(ConsensusError::malformed(format!(
                "unexpected end of input: need {} bytes at offset {}, have {}",
                count,
                self.position,
                self.remaining()
            )));
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> ConsensusResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ConsensusResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> ConsensusResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> ConsensusResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ConsensusResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Reads a var-int, rejecting values above `max` and non-minimal
    /// encodings.
    pub fn read_var_int(&mut self, max: u64) -> ConsensusResult<u64> {
        let value = match self.read_u8()? {
            0xFD => {
                let v = self.read_u16()? as u64;
                if v < 0xFD {
                    return Err(ConsensusError::malformed("non-canonical var-int"));
                }
                v
            }
            0xFE => {
                let v = self.read_u32()? as u64;
                if v <= 0xFFFF {
                    return Err(ConsensusError::malformed("non-canonical var-int"));
                }
                v
            }
            0xFF => {
                let v = self.read_u64()?;
                if v <= 0xFFFF_FFFF {
                    return Err(ConsensusError::malformed("non-canonical var-int"));
                }
                v
            }
            b => b as u64,
        };
        if value > max {
            return Err(ConsensusError::malformed(format!(
                "length {} exceeds maximum {}",
                value, max
            )));
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self, max: usize) -> ConsensusResult<Vec<u8>> {
        let len = self.read_var_int(max as u64)? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_optional_u32(&mut self) -> ConsensusResult<Option<u32>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_u32()?)),
            tag => Err(ConsensusError::malformed(format!(
                "invalid option tag {:#04x}",
                tag
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_int_sizes_match_encoding() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x10000, 0xFFFF_FFFF, 0x1_0000_0000] {
            let mut writer = BinaryWriter::new();
            writer.write_var_int(value);
            assert_eq!(writer.len(), get_var_size(value), "value {:#x}", value);
            let bytes = writer.into_bytes();
            let mut reader = MemoryReader::new(&bytes);
            assert_eq!(reader.read_var_int(u64::MAX).unwrap(), value);
            assert!(reader.ensure_consumed().is_ok());
        }
    }

    #[test]
    fn test_var_int_rejects_non_canonical() {
        let bytes = [0xFD, 0x05, 0x00];
        let mut reader = MemoryReader::new(&bytes);
        assert!(matches!(
            reader.read_var_int(u64::MAX),
            Err(ConsensusError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_var_int_enforces_max() {
        let mut writer = BinaryWriter::new();
        writer.write_var_int(300);
        let bytes = writer.into_bytes();
        assert!(MemoryReader::new(&bytes).read_var_int(299).is_err());
        assert_eq!(MemoryReader::new(&bytes).read_var_int(300).unwrap(), 300);
    }

    #[test]
    fn test_short_input() {
        let mut reader = MemoryReader::new(&[1, 2, 3]);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn test_optional_u32() {
        let mut writer = BinaryWriter::new();
        writer.write_optional_u32(Some(7));
        writer.write_optional_u32(None);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![1, 7, 0, 0, 0, 0]);
        let mut reader = MemoryReader::new(&bytes);
        assert_eq!(reader.read_optional_u32().unwrap(), Some(7));
        assert_eq!(reader.read_optional_u32().unwrap(), None);
        assert!(MemoryReader::new(&[2]).read_optional_u32().is_err());
    }
}
