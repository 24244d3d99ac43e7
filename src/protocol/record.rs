//! Record marking over a byte stream.
//!
//! Messages are grouped into records. A record is sent as one or more fragments, each
//! preceded by a 4-byte big-endian header whose high bit marks the last fragment of the
//! record and whose low 31 bits hold the fragment length.
//!
//! The writer buffers everything until [`RecordWriter::end_record`]. The reader hands out
//! the bytes of the current record and refuses to read past its end; the remainder of a
//! record can be dropped with [`RecordReader::skip_record`].
use std::io::{self, Read, Write};

use log::trace;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const HEADER_SIZE: usize = size_of::<u32>();

/// Largest fragment written, and the largest fragment accepted from a peer.
pub const MAX_FRAGMENT: usize = 128 * 1024;

pub struct RecordWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(MAX_FRAGMENT),
        }
    }

    /// Emit the buffered bytes as a complete record.
    pub fn end_record(&mut self) -> io::Result<()> {
        let total = self.buffer.len();
        if total == 0 {
            self.inner.write_all(&LAST_FRAGMENT.to_be_bytes())?;
        }

        let mut chunks = self.buffer.chunks(MAX_FRAGMENT).peekable();
        while let Some(chunk) = chunks.next() {
            let mut header = chunk.len() as u32;
            if chunks.peek().is_none() {
                header |= LAST_FRAGMENT;
            }
            self.inner.write_all(&header.to_be_bytes())?;
            self.inner.write_all(chunk)?;
        }

        self.inner.flush()?;
        self.buffer.clear();
        trace!("sent record of {total} bytes");
        Ok(())
    }

    /// Bytes written since the last record boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the unsent part of the current record. Returns the number of bytes dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for RecordWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Records only leave the buffer on [`RecordWriter::end_record`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct RecordReader<R: Read> {
    inner: R,
    fragment: Vec<u8>,
    position: usize,
    last_fragment: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            fragment: Vec::new(),
            position: 0,
            last_fragment: true,
        }
    }

    fn remaining(&self) -> usize {
        self.fragment.len() - self.position
    }

    fn next_fragment(&mut self) -> io::Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        let header = u32::from_be_bytes(header);
        let len = (header & !LAST_FRAGMENT) as usize;

        if len > MAX_FRAGMENT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("fragment of {len} bytes exceeds the {MAX_FRAGMENT} byte limit"),
            ));
        }

        self.fragment.clear();
        self.fragment.resize(len, 0);
        self.inner.read_exact(&mut self.fragment)?;
        self.position = 0;
        self.last_fragment = header & LAST_FRAGMENT != 0;
        Ok(())
    }

    /// Drop the unread part of the current record; the next read starts a new record.
    ///
    /// Returns the number of bytes discarded.
    pub fn skip_record(&mut self) -> io::Result<usize> {
        let mut discarded = self.remaining();
        while !self.last_fragment {
            self.next_fragment()?;
            discarded += self.fragment.len();
        }
        self.fragment.clear();
        self.position = 0;
        self.last_fragment = false;
        Ok(discarded)
    }

    /// Drop whatever is left of a record already being read, without waiting for a new one.
    pub fn discard_current(&mut self) -> io::Result<usize> {
        if self.fragment.is_empty() && !self.last_fragment {
            return Ok(0);
        }
        let mut discarded = self.remaining();
        self.position = self.fragment.len();
        while !self.last_fragment {
            self.next_fragment()?;
            discarded += self.fragment.len();
            self.position = self.fragment.len();
        }
        Ok(discarded)
    }

    /// True when every byte of the current record has been consumed.
    pub fn is_end_of_record(&self) -> bool {
        self.remaining() == 0 && self.last_fragment
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for RecordReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.remaining() == 0 {
            if self.last_fragment {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past the end of the current record",
                ));
            }
            self.next_fragment()?;
        }

        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.fragment[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn framed(records: &[&[u8]]) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new());
        for record in records {
            writer.write_all(record).unwrap();
            writer.end_record().unwrap();
        }
        writer.inner
    }

    #[test]
    fn header_marks_last_fragment() {
        let bytes = framed(&[b"abc"]);
        assert_eq!(&bytes[..4], &(LAST_FRAGMENT | 3).to_be_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn reads_stop_at_record_end() {
        let mut reader = RecordReader::new(Cursor::new(framed(&[b"abc", b"defg"])));
        reader.skip_record().unwrap();

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(reader.is_end_of_record());

        let err = reader.read_exact(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        reader.skip_record().unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"defg");
    }

    #[test]
    fn skip_discards_unread_bytes() {
        let mut reader = RecordReader::new(Cursor::new(framed(&[b"0123456789", b"next"])));
        reader.skip_record().unwrap();
        reader.read_exact(&mut [0u8; 2]).unwrap();

        assert_eq!(reader.skip_record().unwrap(), 8);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"next");
    }

    #[test]
    fn large_records_span_fragments() {
        let payload: Vec<u8> = (0..MAX_FRAGMENT * 2 + 10).map(|i| i as u8).collect();
        let mut reader = RecordReader::new(Cursor::new(framed(&[&payload])));
        reader.skip_record().unwrap();

        let mut out = vec![0u8; payload.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, payload);
        assert!(reader.is_end_of_record());
    }

    #[test]
    fn oversized_fragment_is_rejected() {
        let header = (MAX_FRAGMENT as u32 + 1) | LAST_FRAGMENT;
        let mut reader = RecordReader::new(Cursor::new(header.to_be_bytes().to_vec()));
        reader.skip_record().unwrap();

        let err = reader.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn discarded_bytes_never_reach_the_peer() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_all(b"half a message").unwrap();
        assert_eq!(writer.discard(), 14);
        writer.write_all(b"next").unwrap();
        writer.end_record().unwrap();

        let mut reader = RecordReader::new(Cursor::new(writer.get_ref().clone()));
        reader.skip_record().unwrap();
        let mut received = [0u8; 4];
        reader.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"next");
        assert!(reader.is_end_of_record());
    }

    #[test]
    fn discard_current_does_not_block_between_records() {
        let mut reader = RecordReader::new(Cursor::new(framed(&[b"abcdef"])));
        reader.skip_record().unwrap();
        assert_eq!(reader.discard_current().unwrap(), 0);

        reader.read_exact(&mut [0u8; 2]).unwrap();
        assert_eq!(reader.discard_current().unwrap(), 4);
        assert!(reader.is_end_of_record());
    }
}
