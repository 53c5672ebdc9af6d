//! Response body parsers.
//!
//! Each parser takes bytes off the front of its input and yields at most one
//! piece of body per call, so the caller can stop as soon as the reader has
//! no more demand. Framing bytes (chunk sizes, CRLFs, trailers) are consumed
//! without producing anything.

use bytes::{Buf as _, Bytes};
use http::HeaderMap;

use super::decode::{parse_headers, BodyKind};
use crate::client::ProtocolError;

/// What one call to [`ContentParser::next`] produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// A piece of the body.
    Data(Bytes),
    /// The input ran out before anything could be produced.
    NeedMore,
    /// The body is complete. Remaining input belongs to whatever follows.
    Done,
}

#[derive(Debug)]
pub(crate) enum ContentParser {
    Fixed { remaining: u64 },
    Chunked(ChunkedParser),
    UntilClose { closed: bool },
}

impl ContentParser {
    pub(crate) fn new(kind: BodyKind, max_line: usize) -> Self {
        match kind {
            BodyKind::Empty => ContentParser::Fixed { remaining: 0 },
            BodyKind::Fixed(remaining) => ContentParser::Fixed { remaining },
            BodyKind::Chunked => ContentParser::Chunked(ChunkedParser::new(max_line)),
            BodyKind::UntilClose => ContentParser::UntilClose { closed: false },
        }
    }

    pub(crate) fn next(&mut self, input: &mut Bytes) -> Result<Step, ProtocolError> {
        match self {
            ContentParser::Fixed { remaining } => {
                if *remaining == 0 {
                    return Ok(Step::Done);
                }
                if input.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let n = (*remaining).min(input.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(Step::Data(input.split_to(n)))
            }
            ContentParser::Chunked(parser) => parser.next(input),
            ContentParser::UntilClose { closed } => {
                if !input.is_empty() {
                    return Ok(Step::Data(std::mem::take(input)));
                }
                if *closed {
                    Ok(Step::Done)
                } else {
                    Ok(Step::NeedMore)
                }
            }
        }
    }

    /// The connection reached EOF. Only bodies delimited by the close end
    /// cleanly this way.
    pub(crate) fn on_eof(&mut self) -> Result<(), ProtocolError> {
        if let ContentParser::UntilClose { closed } = self {
            *closed = true;
            return Ok(());
        }
        if self.is_done() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedBody)
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        match self {
            ContentParser::Fixed { remaining } => *remaining == 0,
            ContentParser::Chunked(parser) => parser.state == ChunkState::Done,
            ContentParser::UntilClose { closed } => *closed,
        }
    }

    /// Whether the next call would yield body bytes, which must wait for
    /// the reader's demand. Framing can always be consumed.
    pub(crate) fn at_data(&self) -> bool {
        match self {
            ContentParser::Fixed { remaining } => *remaining > 0,
            ContentParser::Chunked(parser) => {
                matches!(parser.state, ChunkState::Data { remaining } if remaining > 0)
            }
            ContentParser::UntilClose { closed } => !*closed,
        }
    }

    /// Whether the connection can be reused once this body is done.
    pub(crate) fn reusable(&self) -> bool {
        !matches!(self, ContentParser::UntilClose { .. })
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self {
            ContentParser::Chunked(parser) => parser.trailers.take(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

/// Parser for `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub(crate) struct ChunkedParser {
    state: ChunkState,
    line: Vec<u8>,
    max_line: usize,
    pending_crlf: u8,
    trailer_block: Vec<u8>,
    trailers: Option<HeaderMap>,
}

impl ChunkedParser {
    fn new(max_line: usize) -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
            max_line,
            pending_crlf: 0,
            trailer_block: Vec::new(),
            trailers: None,
        }
    }

    fn next(&mut self, input: &mut Bytes) -> Result<Step, ProtocolError> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(Step::Done),
                _ if input.is_empty() => return Ok(Step::NeedMore),
                ChunkState::Size => {
                    let Some(line) = self.read_line(input)? else {
                        continue;
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    let n = remaining.min(input.len() as u64) as usize;
                    let data = input.split_to(n);
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        self.pending_crlf = 2;
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining }
                    };
                    return Ok(Step::Data(data));
                }
                ChunkState::DataEnd => {
                    // A bare LF also ends chunk data. A CR must be followed by LF.
                    while self.pending_crlf > 0 && !input.is_empty() {
                        let byte = input[0];
                        match (self.pending_crlf, byte) {
                            (2, b'\r') => self.pending_crlf = 1,
                            (2, b'\n') | (1, b'\n') => self.pending_crlf = 0,
                            _ => return Err(ProtocolError::ChunkTerminator),
                        }
                        input.advance(1);
                    }
                    if self.pending_crlf == 0 {
                        self.state = ChunkState::Size;
                    }
                }
                ChunkState::Trailers => {
                    let Some(line) = self.read_line(input)? else {
                        continue;
                    };
                    if line.is_empty() {
                        if !self.trailer_block.is_empty() {
                            let block = std::mem::take(&mut self.trailer_block);
                            let trailers = parse_headers(block.split(|b| *b == b'\n'))?;
                            self.trailers = Some(trailers);
                        }
                        self.state = ChunkState::Done;
                    } else {
                        if self.trailer_block.len() + line.len() > self.max_line * 16 {
                            return Err(ProtocolError::ChunkLineTooLong(self.max_line));
                        }
                        self.trailer_block.extend_from_slice(&line);
                        self.trailer_block.push(b'\n');
                    }
                }
            }
        }
    }

    /// Accumulate one line, without its line ending. Returns `None` when the
    /// input ran out first.
    fn read_line(&mut self, input: &mut Bytes) -> Result<Option<Vec<u8>>, ProtocolError> {
        match input.iter().position(|b| *b == b'\n') {
            Some(end) => {
                if self.line.len() + end > self.max_line {
                    return Err(ProtocolError::ChunkLineTooLong(self.max_line));
                }
                self.line.extend_from_slice(&input[..end]);
                input.advance(end + 1);
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                if self.line.len() + input.len() > self.max_line {
                    return Err(ProtocolError::ChunkLineTooLong(self.max_line));
                }
                self.line.extend_from_slice(input);
                input.clear();
                Ok(None)
            }
        }
    }
}

/// Hex size, ignoring any `;extension` that follows.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = trim_whitespace(size);
    if size.is_empty() {
        return Err(ProtocolError::ChunkSize);
    }

    size.iter().try_fold(0u64, |acc, b| {
        let digit = (*b as char).to_digit(16).ok_or(ProtocolError::ChunkSize)?;
        acc.checked_mul(16)
            .and_then(|acc| acc.checked_add(u64::from(digit)))
            .ok_or(ProtocolError::ChunkSize)
    })
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = value {
        if !first.is_ascii_whitespace() {
            break;
        }
        value = rest;
    }
    while let [rest @ .., last] = value {
        if !last.is_ascii_whitespace() {
            break;
        }
        value = rest;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    /// Feed `wire` in pieces of `split` bytes, returning the body and the
    /// bytes left over after the body ended.
    fn run(kind: BodyKind, wire: &[u8], split: usize) -> (Vec<u8>, Vec<u8>) {
        let mut parser = ContentParser::new(kind, 64);
        let mut body = Vec::new();
        let mut leftover = Vec::new();

        for piece in wire.chunks(split.max(1)) {
            let mut input = Bytes::copy_from_slice(piece);
            if parser.is_done() {
                leftover.extend_from_slice(&input);
                continue;
            }
            loop {
                match parser.next(&mut input).unwrap() {
                    Step::Data(data) => body.extend_from_slice(&data),
                    Step::NeedMore => break,
                    Step::Done => {
                        leftover.extend_from_slice(&input);
                        break;
                    }
                }
            }
        }
        (body, leftover)
    }

    #[test]
    fn chunked_wikipedia() {
        let (body, rest) = run(
            BodyKind::Chunked,
            b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
            usize::MAX,
        );
        assert_eq!(body, b"Wikipedia");
        assert!(rest.is_empty());
    }

    #[test]
    fn chunked_is_split_independent() {
        let chunks: Vec<Vec<u8>> = [0usize, 1, 15, 16, 255, 4096, 1 << 20]
            .iter()
            .enumerate()
            .map(|(i, len)| vec![b'a' + i as u8; *len])
            .collect();
        let expected: Vec<u8> = chunks.concat();
        let mut wire = encode(&chunks);
        wire.extend_from_slice(b"NEXT");

        for split in [1, 2, 3, 7, 1000, usize::MAX] {
            let (body, rest) = run(BodyKind::Chunked, &wire, split);
            assert_eq!(body.len(), expected.len(), "split {split}");
            assert!(body == expected, "split {split}");
            assert_eq!(rest, b"NEXT", "split {split}");
        }
    }

    #[test]
    fn chunk_extensions_and_trailers() {
        let wire = b"3;name=value\r\nabc\r\n0\r\nx-sum: 42\r\n\r\n";
        let mut parser = ContentParser::new(BodyKind::Chunked, 64);
        let mut input = Bytes::from_static(wire);
        assert_eq!(parser.next(&mut input).unwrap(), Step::Data(Bytes::from_static(b"abc")));
        assert_eq!(parser.next(&mut input).unwrap(), Step::Done);
        assert_eq!(parser.take_trailers().unwrap()["x-sum"], "42");
    }

    #[test]
    fn chunk_size_line_is_capped() {
        let mut parser = ContentParser::new(BodyKind::Chunked, 8);
        let mut input = Bytes::from_static(b"000000000000001\r\n");
        assert_eq!(
            parser.next(&mut input).unwrap_err(),
            ProtocolError::ChunkLineTooLong(8)
        );
    }

    #[test]
    fn chunk_errors() {
        let mut parser = ContentParser::new(BodyKind::Chunked, 64);
        let mut input = Bytes::from_static(b"zz\r\n");
        assert_eq!(parser.next(&mut input).unwrap_err(), ProtocolError::ChunkSize);

        let mut parser = ContentParser::new(BodyKind::Chunked, 64);
        let mut input = Bytes::from_static(b"1\r\naXY");
        assert!(matches!(parser.next(&mut input).unwrap(), Step::Data(_)));
        assert_eq!(
            parser.next(&mut input).unwrap_err(),
            ProtocolError::ChunkTerminator
        );

        let mut parser = ContentParser::new(BodyKind::Chunked, 64);
        let mut input = Bytes::from_static(b"5\r\nab");
        assert!(matches!(parser.next(&mut input).unwrap(), Step::Data(_)));
        assert_eq!(parser.on_eof().unwrap_err(), ProtocolError::TruncatedBody);
    }

    #[test]
    fn bare_lf_after_chunk_data_is_tolerated() {
        for split in [1, 4, usize::MAX] {
            let (body, rest) = run(BodyKind::Chunked, b"3\r\nabc\n2\r\nde\r\n0\r\n\r\n", split);
            assert_eq!(body, b"abcde", "split {split}");
            assert!(rest.is_empty(), "split {split}");
        }

        let mut parser = ContentParser::new(BodyKind::Chunked, 64);
        let mut input = Bytes::from_static(b"1\r\na\r\r");
        assert!(matches!(parser.next(&mut input).unwrap(), Step::Data(_)));
        assert_eq!(
            parser.next(&mut input).unwrap_err(),
            ProtocolError::ChunkTerminator
        );
    }

    #[test]
    fn fixed_length_any_partition() {
        let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut wire = body.clone();
        wire.extend_from_slice(b"extra");

        for split in [1, 2, 10, 333, 999, 1000, 1005] {
            let (out, rest) = run(BodyKind::Fixed(1000), &wire, split);
            assert_eq!(out, body, "split {split}");
            assert_eq!(rest, b"extra", "split {split}");
        }
    }

    #[test]
    fn fixed_length_never_overreads() {
        let mut parser = ContentParser::new(BodyKind::Fixed(3), 64);
        let mut input = Bytes::from_static(b"abcdef");
        assert_eq!(parser.next(&mut input).unwrap(), Step::Data(Bytes::from_static(b"abc")));
        assert_eq!(parser.next(&mut input).unwrap(), Step::Done);
        assert_eq!(&input[..], b"def");
        assert!(!parser.at_data());
    }

    #[test]
    fn fixed_length_truncated() {
        let mut parser = ContentParser::new(BodyKind::Fixed(3), 64);
        let mut input = Bytes::from_static(b"ab");
        parser.next(&mut input).unwrap();
        assert_eq!(parser.on_eof().unwrap_err(), ProtocolError::TruncatedBody);
    }

    #[test]
    fn until_close_ends_on_eof() {
        let mut parser = ContentParser::new(BodyKind::UntilClose, 64);
        let mut input = Bytes::from_static(b"hello");
        assert_eq!(parser.next(&mut input).unwrap(), Step::Data(Bytes::from_static(b"hello")));
        assert_eq!(parser.next(&mut input).unwrap(), Step::NeedMore);
        parser.on_eof().unwrap();
        assert_eq!(parser.next(&mut input).unwrap(), Step::Done);
        assert!(!parser.reusable());
    }
}
