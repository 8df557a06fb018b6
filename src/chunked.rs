//! Sans-io `transfer-encoding: chunked` codec.

use crate::buffer::BufferWindow;
use crate::http11::try_parse_fields;
use crate::Error;
use std::fmt;
use std::io::Write;
use std::ops::Range;

/// Longest chunk size line (incl extensions) accepted.
const MAX_SIZE_LINE: usize = 1024;

/// Longest trailer block accepted.
const MAX_TRAILERS: usize = 8192;

/// Outcome of one [`ChunkedDecoder::decode`] call.
#[derive(Debug)]
pub enum Decoded {
    /// Body bytes at `src[data]`. `consumed` bytes of `src` are used up.
    Data { consumed: usize, data: Range<usize> },
    /// More input is needed. `consumed` framing bytes are used up.
    NeedMore { consumed: usize },
    /// Body ended.
    End {
        consumed: usize,
        trailers: Option<http::HeaderMap>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
    End,
}

/// Decoder of a chunked body.
pub struct ChunkedDecoder {
    state: State,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder { state: State::Size }
    }

    pub fn is_end(&self) -> bool {
        self.state == State::End
    }

    /// Decode from `src`, delivering at most `max` body bytes.
    pub fn decode(&mut self, src: &[u8], max: usize) -> Result<Decoded, Error> {
        let mut pos = 0;

        loop {
            let rest = &src[pos..];

            match self.state {
                State::Size => {
                    let idx = match find_crlf(rest) {
                        Some(v) => v,
                        None => {
                            if rest.len() > MAX_SIZE_LINE {
                                return Err(Error::Protocol("Chunk size line too long".into()));
                            }
                            return Ok(Decoded::NeedMore { consumed: pos });
                        }
                    };

                    let size = parse_size(&rest[..idx])?;
                    trace!("Chunk size: {}", size);

                    pos += idx + 2;

                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data(size)
                    };
                }

                State::Data(left) => {
                    let n = (left.min(usize::max_value() as u64) as usize)
                        .min(rest.len())
                        .min(max);

                    if n == 0 {
                        return Ok(Decoded::NeedMore { consumed: pos });
                    }

                    let left = left - n as u64;
                    self.state = if left == 0 {
                        State::DataCrlf
                    } else {
                        State::Data(left)
                    };

                    return Ok(Decoded::Data {
                        consumed: pos + n,
                        data: pos..pos + n,
                    });
                }

                State::DataCrlf => {
                    if rest.len() < 2 {
                        return Ok(Decoded::NeedMore { consumed: pos });
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(Error::Protocol("Missing CRLF after chunk".into()));
                    }
                    pos += 2;
                    self.state = State::Size;
                }

                State::Trailers => {
                    if rest.starts_with(b"\r\n") {
                        self.state = State::End;
                        return Ok(Decoded::End {
                            consumed: pos + 2,
                            trailers: None,
                        });
                    }

                    match try_parse_fields(rest)? {
                        Some((trailers, len)) => {
                            self.state = State::End;
                            return Ok(Decoded::End {
                                consumed: pos + len,
                                trailers: Some(trailers),
                            });
                        }
                        None => {
                            if rest.len() > MAX_TRAILERS {
                                return Err(Error::Protocol("Chunked trailers too long".into()));
                            }
                            return Ok(Decoded::NeedMore { consumed: pos });
                        }
                    }
                }

                State::End => {
                    return Ok(Decoded::End {
                        consumed: pos,
                        trailers: None,
                    });
                }
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        ChunkedDecoder::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_size(line: &[u8]) -> Result<u64, Error> {
    // chunk extensions are ignored.
    let line = match line.iter().position(|b| *b == b';') {
        Some(i) => &line[..i],
        None => line,
    };

    let s = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("Chunk size not utf-8".into()))?
        .trim();

    u64::from_str_radix(s, 16)
        .map_err(|_| Error::Protocol(format!("Bad chunk size: {:?}", s)))
}

/// Encoder of a chunked body.
pub struct ChunkedEncoder;

impl ChunkedEncoder {
    #[allow(clippy::write_with_newline)]
    pub fn write_chunk(data: &[u8], out: &mut BufferWindow) -> Result<(), Error> {
        if data.is_empty() {
            // a zero size chunk would end the body.
            return Ok(());
        }

        let mut head = Vec::with_capacity(12);
        write!(head, "{:x}\r\n", data.len())?;

        out.append(&head);
        out.append(data);
        out.append(b"\r\n");

        Ok(())
    }

    #[allow(clippy::write_with_newline)]
    pub fn write_finish(trailers: Option<&http::HeaderMap>, out: &mut BufferWindow) -> Result<(), Error> {
        let mut end = Vec::with_capacity(64);

        write!(end, "0\r\n")?;

        if let Some(trailers) = trailers {
            for (name, value) in trailers {
                write!(end, "{}: ", name)?;
                end.write_all(value.as_bytes())?;
                write!(end, "\r\n")?;
            }
        }

        write!(end, "\r\n")?;

        out.append(&end);

        Ok(())
    }
}

impl fmt::Debug for ChunkedDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkedDecoder({:?})", self.state)
    }
}
