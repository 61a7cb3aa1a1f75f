//! Bounds-checked little/big-endian reader shared by the BTF, BTF.ext and
//! map-definition parsers.

use object::{Endian, Endianness};

use crate::error::{LoaderError, LoaderResult};

/// Cursor over a byte slice with a fixed byte order.
pub(crate) struct ByteReader<'a>
{
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
    context: &'static str,
}

impl<'a> ByteReader<'a>
{
    pub(crate) fn new(data: &'a [u8], endian: Endianness, context: &'static str) -> Self
    {
        Self {
            data,
            pos: 0,
            endian,
            context,
        }
    }

    pub(crate) fn position(&self) -> usize
    {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize
    {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn is_empty(&self) -> bool
    {
        self.remaining() == 0
    }

    pub(crate) fn skip(&mut self, len: usize) -> LoaderResult<()>
    {
        self.take(len).map(|_| ())
    }

    pub(crate) fn take(&mut self, len: usize) -> LoaderResult<&'a [u8]>
    {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len()).ok_or_else(|| {
            LoaderError::parse(
                self.context,
                format!("truncated: need {len} bytes at offset {}, have {}", self.pos, self.remaining()),
            )
        })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> LoaderResult<u8>
    {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> LoaderResult<u16>
    {
        let bytes = self.take(2)?;
        Ok(self.endian.read_u16_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> LoaderResult<u32>
    {
        let bytes = self.take(4)?;
        Ok(self.endian.read_u32_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> LoaderResult<i32>
    {
        Ok(self.u32()? as i32)
    }
}

/// Slice `data[offset..offset + len]`, reporting a parse error on overrun.
pub(crate) fn sub_slice<'a>(data: &'a [u8], offset: usize, len: usize, context: &str) -> LoaderResult<&'a [u8]>
{
    offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .map(|end| &data[offset..end])
        .ok_or_else(|| {
            LoaderError::parse(
                context,
                format!("range {offset}..{} exceeds {} bytes", offset.saturating_add(len), data.len()),
            )
        })
}

/// Read a NUL-terminated string at `offset` of a string table.
pub(crate) fn c_str_at(table: &[u8], offset: usize) -> Option<&str>
{
    let tail = table.get(offset..)?;
    let end = tail.iter().position(|byte| *byte == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_reader_respects_endianness()
    {
        let data = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02];
        let mut little = ByteReader::new(&data, Endianness::Little, "test");
        assert_eq!(little.u32().unwrap(), 1);
        let mut big = ByteReader::new(&data[4..], Endianness::Big, "test");
        assert_eq!(big.u32().unwrap(), 2);
    }

    #[test]
    fn test_reader_reports_truncation()
    {
        let data = [0u8; 3];
        let mut reader = ByteReader::new(&data, Endianness::Little, "header");
        let err = reader.u32().unwrap_err();
        assert!(err.to_string().contains("header"));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_c_str_at()
    {
        let table = b"\0foo\0bar\0";
        assert_eq!(c_str_at(table, 0), Some(""));
        assert_eq!(c_str_at(table, 1), Some("foo"));
        assert_eq!(c_str_at(table, 5), Some("bar"));
        assert_eq!(c_str_at(table, 20), None);
    }
}
