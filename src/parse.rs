//! HTTP/1.1 wire grammar
//!
//! HTTP/1.1 https://httpwg.org/specs/rfc9112.html
//! HTTP semantics https://httpwg.org/specs/rfc9110.html
//!
//! Streaming parsers: `nom::Err::Incomplete` means "needs more bytes", which
//! the callers map to [`crate::Progress::NeedMoreInput`]. Anything else that
//! fails is a syntax error.

use http::Version;
use nom::{
    bytes::streaming::{tag, take, take_until, take_while1},
    combinator::map_res,
    sequence::terminated,
    IResult,
};

use crate::types::{Headers, Method};

pub(crate) const CRLF: &[u8] = b"\r\n";

/// A parsed request line: `GET /path HTTP/1.1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: Version,
}

// Looks like `GET /path HTTP/1.1\r\n`
pub(crate) fn request_line(i: &[u8]) -> IResult<&[u8], RequestLine> {
    let (i, method) = terminated(method, space1)(i)?;
    let (i, target) = terminated(target, space1)(i)?;
    let (i, version) = terminated(http_version, tag(CRLF))(i)?;

    let line = RequestLine {
        method,
        target,
        version,
    };
    Ok((i, line))
}

fn method(i: &[u8]) -> IResult<&[u8], Method> {
    let (i, token) = token(i)?;
    Ok((i, Method::from_token(&token)))
}

/// A short textual identifier that does not include whitespace or delimiters,
/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn token(i: &[u8]) -> IResult<&[u8], String> {
    let (i, token) = take_while1(is_tchar)(i)?;
    // tchars are a subset of ASCII
    let token = String::from_utf8_lossy(token).into_owned();
    Ok((i, token))
}

/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn is_tchar(c: u8) -> bool {
    c.is_ascii_graphic() && !is_delimiter(c)
}

/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn is_delimiter(c: u8) -> bool {
    memchr::memchr(c, br#"(),/:;<=>?@[\]{}""#).is_some()
}

fn target(i: &[u8]) -> IResult<&[u8], String> {
    let (i, target) = take_while1(is_uri_char)(i)?;
    let target = String::from_utf8_lossy(target).into_owned();
    Ok((i, target))
}

/// Returns true if `c` is a character that can be found in an URI
/// cf. https://stackoverflow.com/a/7109208
fn is_uri_char(c: u8) -> bool {
    memchr::memchr(
        c,
        br#"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._~:/?#[]@!$&'()*+,;%="#,
    )
    .is_some()
}

fn http_version(i: &[u8]) -> IResult<&[u8], Version> {
    let (i, _) = tag(&b"HTTP/1."[..])(i)?;
    let (i, minor) = take(1usize)(i)?;
    let version = match minor[0] {
        b'0' => Version::HTTP_10,
        b'1' => Version::HTTP_11,
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Digit,
            )));
        }
    };

    Ok((i, version))
}

/// Parse header lines up to and including the `CRLF` that ends the header
/// section.
pub(crate) fn headers_and_crlf(mut i: &[u8]) -> IResult<&[u8], Headers> {
    let mut headers = Headers::default();
    loop {
        if let Ok((i, _)) = tag::<_, _, nom::error::Error<&[u8]>>(CRLF)(i) {
            // end of headers
            return Ok((i, headers));
        }

        let (i_next, (name, value)) = header_field(i)?;
        headers.append(name, value);
        i = i_next;
    }
}

/// Parse a single `name: value` header line, CRLF included
pub(crate) fn header_field(i: &[u8]) -> IResult<&[u8], (String, Vec<u8>)> {
    let (i, name) = token(i)?;
    let (i, _) = tag(&b":"[..])(i)?;
    let (i, _) = nom::bytes::streaming::take_while(|c| c == b' ' || c == b'\t')(i)?;
    let (i, value) = terminated(take_until(CRLF), tag(CRLF))(i)?;

    Ok((i, (name, value.to_vec())))
}

/// Parses a chunked transfer coding chunk size (hex text followed by CRLF)
pub(crate) fn chunk_size(i: &[u8]) -> IResult<&[u8], u64> {
    terminated(u64_text_hex, tag(CRLF))(i)
}

pub(crate) fn crlf(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = tag(CRLF)(i)?;
    Ok((i, ()))
}

/// Parses text as a hex u64
fn u64_text_hex(i: &[u8]) -> IResult<&[u8], u64> {
    let f = take_while1(nom::character::is_hex_digit);
    let f = map_res(f, std::str::from_utf8);
    let mut f = map_res(f, |s| u64::from_str_radix(s, 16));
    f(i)
}

/// Parse at least one SP character
fn space1(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = take_while1(|c| c == b' ')(i)?;
    Ok((i, ()))
}
