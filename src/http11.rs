//! Sans-io HTTP/1.x head parsing and writing.

use crate::Error;
use http::header::{HeaderName, HeaderValue};
use std::io::Write;

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

/// Max number of headers parsed in one head.
pub const MAX_HEADERS: usize = 128;

fn version_str(v: http::Version) -> Result<&'static str, Error> {
    match v {
        http::Version::HTTP_10 => Ok("1.0"),
        http::Version::HTTP_11 => Ok("1.1"),
        _ => Err(Error::User(format!("Unsupported http version: {:?}", v))),
    }
}

fn version_of(v: Option<u8>) -> Result<http::Version, Error> {
    match v {
        Some(0) => Ok(http::Version::HTTP_10),
        Some(1) => Ok(http::Version::HTTP_11),
        _ => Err(Error::Protocol(format!("Unhandled http version: {:?}", v))),
    }
}

/// Write an http/1.1 request head.
#[allow(clippy::write_with_newline)]
pub fn write_http1x_req(req: &http::Request<()>, out: &mut Vec<u8>) -> Result<(), Error> {
    let start = out.len();

    // Path and query
    let pq = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let ver = version_str(req.version())?;

    write!(out, "{} {} HTTP/{}\r\n", req.method(), pq, ver)?;

    if !req.headers().contains_key(http::header::HOST) {
        // fall back on uri host
        if let Some(h) = req.uri().host() {
            write!(out, "host: {}", h)?;
            if let Some(p) = req.uri().port_u16() {
                write!(out, ":{}", p)?;
            }
            write!(out, "\r\n")?;
        }
    }

    write_headers(req.headers(), out)?;

    debug!(
        "write_http11_req: {:?}",
        String::from_utf8_lossy(&out[start..])
    );

    Ok(())
}

/// Write an http/1.x response head.
#[allow(clippy::write_with_newline)]
pub fn write_http1x_res(res: &http::Response<()>, out: &mut Vec<u8>) -> Result<(), Error> {
    let start = out.len();

    let ver = version_str(res.version())?;

    write!(
        out,
        "HTTP/{} {} {}\r\n",
        ver,
        res.status().as_u16(),
        res.status().canonical_reason().unwrap_or("Unknown")
    )?;

    write_headers(res.headers(), out)?;

    debug!(
        "write_http11_res: {:?}",
        String::from_utf8_lossy(&out[start..])
    );

    Ok(())
}

#[allow(clippy::write_with_newline)]
fn write_headers(headers: &http::HeaderMap, out: &mut Vec<u8>) -> Result<(), Error> {
    for (name, value) in headers {
        write!(out, "{}: ", name)?;
        out.write_all(value.as_bytes())?;
        write!(out, "\r\n")?;
    }
    write!(out, "\r\n")?;
    Ok(())
}

/// Attempt to parse an http/1.1 response.
pub fn try_parse_res(buf: &[u8]) -> Result<Option<(http::Response<()>, usize)>, Error> {
    trace!("try_parse_res: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Response::new(&mut headers);

    let len = match parser.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let mut bld = http::Response::builder().version(version_of(parser.version)?);

    if let Some(code) = parser.code {
        bld = bld.status(code);
    }

    if let Some(h) = bld.headers_mut() {
        append_headers(h, parser.headers);
    }

    let built = bld.body(())?;

    debug!("try_parse_http11 success: {:?}", built);

    Ok(Some((built, len)))
}

/// Attempt to parse an http/1.1 request.
pub fn try_parse_req(buf: &[u8]) -> Result<Option<(http::Request<()>, usize)>, Error> {
    trace!("try_parse_req: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);

    let len = match parser.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let mut bld = http::Request::builder().version(version_of(parser.version)?);

    if let Some(path) = parser.path {
        bld = bld.uri(path);
    }

    if let Some(method) = parser.method {
        bld = bld.method(method);
    }

    if let Some(h) = bld.headers_mut() {
        append_headers(h, parser.headers);
    }

    let built = bld.body(())?;

    debug!("try_parse_http11 success: {:?}", built);

    Ok(Some((built, len)))
}

/// Attempt to parse a block of header fields terminated by an empty line, such as
/// chunked trailers.
pub fn try_parse_fields(buf: &[u8]) -> Result<Option<(http::HeaderMap, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

    match httparse::parse_headers(buf, &mut headers)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete((len, parsed)) => {
            let mut map = http::HeaderMap::new();
            append_headers(&mut map, parsed);
            Ok(Some((map, len)))
        }
    }
}

fn append_headers(map: &mut http::HeaderMap, parsed: &[httparse::Header<'_>]) {
    for head in parsed {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }
}
