use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// The four legal framing combinations. Modeled as an enum rather than
/// independent boolean flags so only these four states are
/// constructible — there is no way to ask for, say, a length prefix
/// without a delimiter and a sequence number at the same time other
/// than through [`Framing::RleSequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Frames end at the next occurrence of `delimiter`.
    Delimiter { delimiter: Vec<u8> },
    /// Frames are prefixed with `decimal_length ":"`.
    Rle,
    /// Frames carry a `decimal_seq ":"` prefix and end at `delimiter`.
    SequenceDelimited { delimiter: Vec<u8> },
    /// Frames are prefixed with `total_length ":" decimal_seq ":"`,
    /// where `total_length` covers the sequence prefix plus payload.
    RleSequence,
}

impl Framing {
    pub fn delimiter(delimiter: impl Into<Vec<u8>>) -> Self {
        Framing::Delimiter {
            delimiter: delimiter.into(),
        }
    }

    pub fn rle() -> Self {
        Framing::Rle
    }

    pub fn sequence_delimited(delimiter: impl Into<Vec<u8>>) -> Self {
        Framing::SequenceDelimited {
            delimiter: delimiter.into(),
        }
    }

    pub fn rle_sequence() -> Self {
        Framing::RleSequence
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame length prefix is malformed: {0:?}")]
    MalformedLength(String),
    #[error("frame of {size} bytes exceeds the {cap} byte buffer cap")]
    FrameTooLarge { size: usize, cap: usize },
    #[error("io error reading framed stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull-based parser turning a byte stream into discrete message
/// frames. Residual bytes that do not yet form a complete frame are
/// preserved across [`FramedReader::read`] calls on the same reader.
pub struct FramedReader {
    max_buffer_size: usize,
    framing: Framing,
    residual: BytesMut,
    next_sequence: u64,
    offset: u64,
}

impl FramedReader {
    pub fn new(max_buffer_size: usize, framing: Framing) -> Self {
        Self {
            max_buffer_size,
            framing,
            residual: BytesMut::new(),
            next_sequence: 0,
            offset: 0,
        }
    }

    /// Clears the residual buffer and resets the logical offset used
    /// for diagnostics, e.g. when a caller seeks the underlying reader.
    pub fn reset(&mut self, pos: u64) {
        self.residual.clear();
        self.next_sequence = 0;
        self.offset = pos;
    }

    /// Reads from `reader` until it signals end of stream, invoking
    /// `on_frame(payload, sequence)` once per fully parsed frame.
    /// Trailing bytes that do not form a complete frame are discarded
    /// at EOF but kept across calls otherwise. Returns `Ok(())` on a
    /// clean EOF.
    pub async fn read<R, F>(&mut self, reader: &mut R, mut on_frame: F) -> Result<(), FramingError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes, u64),
    {
        let mut chunk = vec![0u8; 8192];
        loop {
            self.drain_complete_frames(&mut on_frame)?;

            let n = reader.read(&mut chunk).await.map_err(FramingError::Io)?;
            if n == 0 {
                self.drain_complete_frames(&mut on_frame)?;
                return Ok(());
            }
            self.offset += n as u64;
            self.residual.extend_from_slice(&chunk[..n]);
        }
    }

    fn drain_complete_frames<F>(&mut self, on_frame: &mut F) -> Result<(), FramingError>
    where
        F: FnMut(Bytes, u64),
    {
        while let Some((payload, sequence)) = self.try_parse_one()? {
            on_frame(payload, sequence);
        }
        Ok(())
    }

    fn try_parse_one(&mut self) -> Result<Option<(Bytes, u64)>, FramingError> {
        match self.framing.clone() {
            Framing::Delimiter { delimiter } => self.parse_delimiter(&delimiter, false),
            Framing::SequenceDelimited { delimiter } => self.parse_delimiter(&delimiter, true),
            Framing::Rle => self.parse_rle(),
            Framing::RleSequence => self.parse_rle_sequence(),
        }
    }

    fn parse_delimiter(
        &mut self,
        delimiter: &[u8],
        has_sequence_prefix: bool,
    ) -> Result<Option<(Bytes, u64)>, FramingError> {
        let Some(delim_pos) = find(&self.residual, delimiter) else {
            if self.residual.len() > self.max_buffer_size {
                return Err(FramingError::FrameTooLarge {
                    size: self.residual.len(),
                    cap: self.max_buffer_size,
                });
            }
            return Ok(None);
        };
        if delim_pos > self.max_buffer_size {
            return Err(FramingError::FrameTooLarge {
                size: delim_pos,
                cap: self.max_buffer_size,
            });
        }

        let mut frame = self.residual.split_to(delim_pos).freeze();
        self.residual.advance(delimiter.len());

        let sequence = if has_sequence_prefix {
            let Some(colon) = frame.iter().position(|b| *b == b':') else {
                return Err(FramingError::MalformedLength(
                    String::from_utf8_lossy(&frame).into_owned(),
                ));
            };
            let seq_str = std::str::from_utf8(&frame[..colon])
                .map_err(|_| FramingError::MalformedLength("non-utf8 sequence prefix".into()))?;
            let seq: u64 = seq_str
                .parse()
                .map_err(|_| FramingError::MalformedLength(seq_str.to_string()))?;
            frame = frame.slice(colon + 1..);
            seq
        } else {
            let seq = self.next_sequence;
            self.next_sequence += 1;
            seq
        };

        Ok(Some((frame, sequence)))
    }

    fn parse_rle(&mut self) -> Result<Option<(Bytes, u64)>, FramingError> {
        let Some((header_len, length)) = parse_leading_length(&self.residual)? else {
            return Ok(None);
        };
        if header_len + length > self.max_buffer_size {
            return Err(FramingError::FrameTooLarge {
                size: header_len + length,
                cap: self.max_buffer_size,
            });
        }
        if self.residual.len() < header_len + length {
            return Ok(None);
        }
        self.residual.advance(header_len);
        let payload = self.residual.split_to(length).freeze();
        let seq = self.next_sequence;
        self.next_sequence += 1;
        Ok(Some((payload, seq)))
    }

    fn parse_rle_sequence(&mut self) -> Result<Option<(Bytes, u64)>, FramingError> {
        let Some((header_len, total_length)) = parse_leading_length(&self.residual)? else {
            return Ok(None);
        };
        if header_len + total_length > self.max_buffer_size {
            return Err(FramingError::FrameTooLarge {
                size: header_len + total_length,
                cap: self.max_buffer_size,
            });
        }
        if self.residual.len() < header_len + total_length {
            return Ok(None);
        }
        self.residual.advance(header_len);
        let body = self.residual.split_to(total_length).freeze();

        let Some(colon) = body.iter().position(|b| *b == b':') else {
            return Err(FramingError::MalformedLength(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        };
        let seq_str = std::str::from_utf8(&body[..colon])
            .map_err(|_| FramingError::MalformedLength("non-utf8 sequence prefix".into()))?;
        let seq: u64 = seq_str
            .parse()
            .map_err(|_| FramingError::MalformedLength(seq_str.to_string()))?;
        let payload = body.slice(colon + 1..);

        Ok(Some((payload, seq)))
    }
}

/// Parses a leading `"<digits>:"` header from `buf`, returning
/// `(header_len_including_colon, parsed_value)`. Returns `Ok(None)` if
/// the colon has not arrived yet (more data needed).
fn parse_leading_length(buf: &BytesMut) -> Result<Option<(usize, usize)>, FramingError> {
    let Some(colon) = buf.iter().position(|b| *b == b':') else {
        if buf.len() > 20 {
            return Err(FramingError::MalformedLength(
                String::from_utf8_lossy(&buf[..20]).into_owned(),
            ));
        }
        return Ok(None);
    };
    let digits = std::str::from_utf8(&buf[..colon])
        .map_err(|_| FramingError::MalformedLength("non-utf8 length prefix".into()))?;
    let value: usize = digits
        .parse()
        .map_err(|_| FramingError::MalformedLength(digits.to_string()))?;
    Ok(Some((colon + 1, value)))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(framing: Framing, data: &[u8]) -> Vec<(Vec<u8>, u64)> {
        let mut reader = FramedReader::new(1024, framing);
        let mut cursor = Cursor::new(data.to_vec());
        let mut out = Vec::new();
        reader
            .read(&mut cursor, |payload, seq| {
                out.push((payload.to_vec(), seq));
            })
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn s1_delimiter_framing() {
        let frames = collect(Framing::delimiter("\n"), b"test1\ntest 2\ntest\r3").await;
        assert_eq!(
            frames,
            vec![(b"test1".to_vec(), 0), (b"test 2".to_vec(), 1)]
        );
    }

    #[tokio::test]
    async fn s2_rle_framing() {
        let frames = collect(Framing::rle(), b"5:test16:test 26:test\t3").await;
        assert_eq!(
            frames,
            vec![
                (b"test1".to_vec(), 0),
                (b"test 2".to_vec(), 1),
                (b"test\t3".to_vec(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn s3_rle_sequence_framing() {
        let frames = collect(Framing::rle_sequence(), b"7:0:test18:1:test 28:2:test\t3").await;
        assert_eq!(
            frames,
            vec![
                (b"test1".to_vec(), 0),
                (b"test 2".to_vec(), 1),
                (b"test\t3".to_vec(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn residual_bytes_persist_across_calls() {
        let mut reader = FramedReader::new(1024, Framing::delimiter("\n"));
        let mut first = Cursor::new(b"test1\npart".to_vec());
        let mut out = Vec::new();
        reader
            .read(&mut first, |p, s| out.push((p.to_vec(), s)))
            .await
            .unwrap();
        assert_eq!(out, vec![(b"test1".to_vec(), 0)]);

        let mut second = Cursor::new(b"ial\n".to_vec());
        reader
            .read(&mut second, |p, s| out.push((p.to_vec(), s)))
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![(b"test1".to_vec(), 0), (b"partial".to_vec(), 1)]
        );
    }
}
