//! Position-tracking reads with big-endian primitives.

use std::io::{self, Read};

/// Wraps any [`Read`] source and keeps a running byte position, which the
/// envelope cursor arithmetic and the MPEG-offset seek depend on.
pub struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes consumed from the source so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Discard exactly `n` bytes.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let copied = io::copy(&mut self.inner.by_ref().take(n), &mut io::sink())?;
        self.position += copied;
        if copied < n {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Read until `buf` is full or the source ends; returns the number of
    /// bytes read, 0 only at end of input.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.inner.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.position += total as u64;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_advance_the_position() {
        let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut reader = CountingReader::new(&data[..]);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_u32().unwrap(), 0x04050607);
        assert_eq!(reader.position(), 7);
    }

    #[test]
    fn skip_counts_and_detects_short_input() {
        let data = [0u8; 10];
        let mut reader = CountingReader::new(&data[..]);
        reader.skip(8).unwrap();
        assert_eq!(reader.position(), 8);
        assert!(reader.skip(8).is_err());
        assert_eq!(reader.position(), 10);
    }

    #[test]
    fn read_fully_stops_at_end_of_input() {
        let data = [0xAAu8; 100];
        let mut reader = CountingReader::new(&data[..]);
        let mut buf = [0u8; 188];
        assert_eq!(reader.read_fully(&mut buf).unwrap(), 100);
        assert_eq!(reader.read_fully(&mut buf).unwrap(), 0);
    }
}
