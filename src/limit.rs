use crate::buffer::BufferWindow;
use crate::chunked::{ChunkedDecoder, ChunkedEncoder, Decoded};
use crate::Error;
use std::fmt;
use std::str::FromStr;

/// Limit reading request body data given configuration from request headers.
pub(crate) enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    /// Create an instance from request headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked decoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a reader limited by length
    /// 3. Otherwise consider there being no body.
    pub fn from_headers(headers: &http::HeaderMap<http::HeaderValue>) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc7230#page-31
        // If a message is received with both a Transfer-Encoding and a
        // Content-Length header field, the Transfer-Encoding overrides the
        // Content-Length.
        let ret = if is_chunked(headers) {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new())
        } else if headers.contains_key("content-length") {
            let size = get_as::<u64>(headers, "content-length")
                .ok_or_else(|| Error::Protocol("Bad content-length header".into()))?;
            LimitRead::ContentLength(ContentLengthRead { limit: size, total: 0 })
        } else {
            // Closing the connection cannot be used to indicate the end of a
            // request body, since it leaves no possibility for the server to send
            // back a response.
            LimitRead::NoBody
        };

        trace!("LimitRead from headers: {:?}", ret);

        Ok(ret)
    }

    pub fn is_no_body(&self) -> bool {
        match &self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    /// Decode body data from `src`, delivering at most `max` bytes.
    pub fn decode(&mut self, src: &[u8], max: usize) -> Result<Decoded, Error> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.decode(src, max),
            LimitRead::ContentLength(v) => Ok(v.decode(src, max)),
            LimitRead::NoBody => Ok(Decoded::End {
                consumed: 0,
                trailers: None,
            }),
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn decode(&mut self, src: &[u8], max: usize) -> Decoded {
        let left = (self.limit - self.total).min(usize::max_value() as u64) as usize;

        if left == 0 {
            // Nothing more should be read.
            return Decoded::End {
                consumed: 0,
                trailers: None,
            };
        }

        let n = left.min(src.len()).min(max);

        if n == 0 {
            return Decoded::NeedMore { consumed: 0 };
        }

        self.total += n as u64;

        Decoded::Data {
            consumed: n,
            data: 0..n,
        }
    }
}

/// Limit writing data by a strategy configured by response headers.
///
/// This is to ensure we don't write more data than "promised" by request/response
/// header configuration.
pub(crate) enum LimitWrite {
    /// Write data using a chunked encoder.
    ChunkedEncoder,
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// Body delimited by closing the connection (HTTP/1.0).
    CloseDelimited,
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    /// Create an instance from response headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked encoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a writer limited by length
    /// 3. Otherwise the body ends when the connection closes.
    pub fn from_headers(headers: &http::HeaderMap<http::HeaderValue>) -> Self {
        let ret = if is_chunked(headers) {
            LimitWrite::ChunkedEncoder
        } else if let Some(limit) = get_as::<u64>(headers, "content-length") {
            LimitWrite::ContentLength(ContentLengthWrite { limit, total: 0 })
        } else {
            LimitWrite::CloseDelimited
        };

        trace!("LimitWrite from headers: {:?}", ret);

        ret
    }

    /// Extra overhead bytes per write() call.
    pub fn overhead(&self) -> usize {
        match self {
            LimitWrite::ChunkedEncoder => 32,
            _ => 0,
        }
    }

    /// Write some data using this limiter.
    pub fn write(&mut self, data: &[u8], out: &mut BufferWindow) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => ChunkedEncoder::write_chunk(data, out),
            LimitWrite::ContentLength(v) => v.write(data, out),
            LimitWrite::CloseDelimited => {
                out.append(data);
                Ok(())
            }
            LimitWrite::NoBody => {
                if data.is_empty() {
                    Ok(())
                } else {
                    Err(Error::User("Body data for a response without body".into()))
                }
            }
        }
    }

    /// Finish up writing, called once after the all `write()` calls are done.
    pub fn finish(
        &mut self,
        trailers: Option<&http::HeaderMap>,
        out: &mut BufferWindow,
    ) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => ChunkedEncoder::write_finish(trailers, out),
            LimitWrite::ContentLength(v) if v.total < v.limit => Err(Error::User(format!(
                "Body data shorter than content-length header: {} < {}",
                v.total, v.limit
            ))),
            _ => Ok(()),
        }
    }
}

/// Limit write by length.
#[derive(Debug)]
pub(crate) struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl ContentLengthWrite {
    fn write(&mut self, data: &[u8], out: &mut BufferWindow) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.total += data.len() as u64;

        if self.total > self.limit {
            let m = format!(
                "Body data longer than content-length header: {} > {}",
                self.total, self.limit
            );
            return Err(Error::User(m));
        }

        out.append(data);

        Ok(())
    }
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder")?,
            LimitRead::ContentLength(l) => write!(f, "ContenLength({})", l.limit)?,
            LimitRead::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

impl fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitWrite::ChunkedEncoder => write!(f, "ChunkedEncoder")?,
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitWrite::CloseDelimited => write!(f, "CloseDelimited")?,
            LimitWrite::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

pub(crate) fn is_chunked(headers: &http::HeaderMap<http::HeaderValue>) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

pub(crate) fn allow_reuse(headers: &http::HeaderMap<http::HeaderValue>, version: http::Version) -> bool {
    is_keep_alive(headers, version == http::Version::HTTP_11)
}

fn is_keep_alive(headers: &http::HeaderMap<http::HeaderValue>, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            if h.eq_ignore_ascii_case("keep-alive") {
                Some(true)
            } else if h.eq_ignore_ascii_case("close") {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

fn get_str<'a>(headers: &'a http::HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

pub(crate) fn get_as<T: FromStr>(headers: &http::HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> http::HeaderMap {
        let mut h = http::HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, v.parse().unwrap());
        }
        h
    }

    #[test]
    fn chunked_overrides_length() {
        let h = headers(&[("transfer-encoding", "chunked"), ("content-length", "10")]);
        assert!(matches!(
            LimitRead::from_headers(&h).unwrap(),
            LimitRead::ChunkedDecoder(_)
        ));
        assert!(matches!(LimitWrite::from_headers(&h), LimitWrite::ChunkedEncoder));
    }

    #[test]
    fn bad_content_length_is_refused() {
        let h = headers(&[("content-length", "ten")]);
        assert!(LimitRead::from_headers(&h).is_err());
    }

    #[test]
    fn content_length_read_stops_at_limit() {
        let h = headers(&[("content-length", "4")]);
        let mut limit = LimitRead::from_headers(&h).unwrap();

        match limit.decode(b"abcdefgh", 100).unwrap() {
            Decoded::Data { consumed, data } => {
                assert_eq!(consumed, 4);
                assert_eq!(data, 0..4);
            }
            d => panic!("unexpected {:?}", d),
        }

        assert!(matches!(
            limit.decode(b"efgh", 100).unwrap(),
            Decoded::End { consumed: 0, .. }
        ));
    }

    #[test]
    fn content_length_write_enforced() {
        let h = headers(&[("content-length", "3")]);
        let mut limit = LimitWrite::from_headers(&h);
        let mut out = BufferWindow::with_capacity(8);

        limit.write(b"ab", &mut out).unwrap();
        assert!(limit.finish(None, &mut out).is_err());
        assert!(limit.write(b"cd", &mut out).is_err());
    }

    #[test]
    fn reuse_by_version() {
        let none = http::HeaderMap::new();
        assert!(allow_reuse(&none, http::Version::HTTP_11));
        assert!(!allow_reuse(&none, http::Version::HTTP_10));
        let close = headers(&[("connection", "Close")]);
        assert!(!allow_reuse(&close, http::Version::HTTP_11));
        let keep = headers(&[("connection", "keep-alive")]);
        assert!(allow_reuse(&keep, http::Version::HTTP_10));
    }
}
