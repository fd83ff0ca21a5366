//! Blocking frame reader/writer over any byte stream.

use std::io::{Read, Write};

use super::{FrameError, FrameHeader, Message, HEADER_LEN};

pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one frame. `Ok(None)` is a clean EOF before any header byte;
    /// a partial header or body is a [`FrameError::ShortRead`].
    ///
    /// The payload length is validated before a single payload byte is
    /// consumed from the transport.
    pub fn read_frame(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>, FrameError> {
        let mut header_buf = [0u8; HEADER_LEN];
        let mut read = 0usize;
        while read < HEADER_LEN {
            let n = self.reader.read(&mut header_buf[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(FrameError::ShortRead);
            }
            read += n;
        }

        let header = FrameHeader::decode(&header_buf)?;

        let mut body = vec![0u8; header.payload_len as usize];
        let mut read_body = 0usize;
        while read_body < body.len() {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(FrameError::ShortRead);
            }
            read_body += n;
        }

        Ok(Some((header, body)))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize and write a whole message. Returns the bytes written.
    pub fn write_message(&mut self, message: &Message) -> Result<usize, FrameError> {
        let bytes = message.encode();
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(bytes.len())
    }
}
