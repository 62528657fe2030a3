//! Accept-Encoding negotiation and transparent decoding of upstream bodies.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::{
    HeaderMap, HeaderValue,
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH},
};
use lowband_config::CompressionConfig;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported content encoding '{0}'")]
    Unsupported(String),
    #[error("malformed {encoding} body: {reason}")]
    Malformed { encoding: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl Coding {
    fn parse(token: &str) -> Result<Self, DecodeError> {
        match token {
            "gzip" | "x-gzip" => Ok(Coding::Gzip),
            "deflate" => Ok(Coding::Deflate),
            "br" => Ok(Coding::Brotli),
            "identity" => Ok(Coding::Identity),
            other => Err(DecodeError::Unsupported(other.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Coding::Gzip => "gzip",
            Coding::Deflate => "deflate",
            Coding::Brotli => "br",
            Coding::Identity => "identity",
        }
    }
}

/// Advertises encodings on the way out and undoes them on the way back.
#[derive(Debug, Clone)]
pub struct Negotiator {
    accept: Option<HeaderValue>,
    max_decoded: u64,
}

impl Negotiator {
    pub fn new(cfg: &CompressionConfig) -> Self {
        let joined = cfg.encodings().join(", ");
        let accept = if joined.is_empty() {
            None
        } else {
            HeaderValue::from_str(&joined).ok()
        };
        Self {
            accept,
            max_decoded: cfg.max_decoded_bytes(),
        }
    }

    /// Overwrite whatever Accept-Encoding the caller sent with ours.
    pub fn advertise(&self, headers: &mut HeaderMap) {
        match &self.accept {
            Some(value) => {
                headers.insert(ACCEPT_ENCODING, value.clone());
            }
            None => {
                headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            }
        }
    }

    /// Decode `body` according to `Content-Encoding`, stripping the
    /// encoding and length headers once the body is plain.
    pub fn decode(&self, headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, DecodeError> {
        let codings = content_codings(headers)?;
        if codings.is_empty() {
            return Ok(body);
        }

        let mut out = body;
        if !out.is_empty() {
            // Codings are listed in the order they were applied.
            for coding in codings.iter().rev() {
                out = self.decode_one(*coding, &out)?;
            }
        }

        debug!(
            target: "lowband::http",
            encodings = ?codings.iter().map(Coding::name).collect::<Vec<_>>(),
            decoded_len = out.len(),
            "Decoded upstream body"
        );

        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);
        Ok(out)
    }

    fn decode_one(&self, coding: Coding, input: &[u8]) -> Result<Bytes, DecodeError> {
        match coding {
            Coding::Identity => Ok(Bytes::copy_from_slice(input)),
            Coding::Gzip => self.read_all(coding, MultiGzDecoder::new(input)),
            // "deflate" is zlib-wrapped per RFC 9110, but raw deflate is common in the wild.
            Coding::Deflate => self
                .read_all(coding, ZlibDecoder::new(input))
                .or_else(|_| self.read_all(coding, DeflateDecoder::new(input))),
            Coding::Brotli => self.read_all(coding, brotli::Decompressor::new(input, 4096)),
        }
    }

    fn read_all<R: Read>(&self, coding: Coding, reader: R) -> Result<Bytes, DecodeError> {
        let mut out = Vec::new();
        let mut limited = reader.take(self.max_decoded.saturating_add(1));
        limited
            .read_to_end(&mut out)
            .map_err(|e| DecodeError::Malformed {
                encoding: coding.name().to_string(),
                reason: e.to_string(),
            })?;

        if out.len() as u64 > self.max_decoded {
            return Err(DecodeError::Malformed {
                encoding: coding.name().to_string(),
                reason: format!("decoded body exceeds {} bytes", self.max_decoded),
            });
        }
        Ok(Bytes::from(out))
    }
}

fn content_codings(headers: &HeaderMap) -> Result<Vec<Coding>, DecodeError> {
    let mut codings = Vec::new();
    for value in headers.get_all(CONTENT_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| DecodeError::Unsupported("<non-ascii>".to_string()))?;
        for token in value.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            codings.push(Coding::parse(&token)?);
        }
    }
    Ok(codings)
}

#[cfg(test)]
mod tests {
    use super::{DecodeError, Negotiator};
    use bytes::Bytes;
    use flate2::{
        Compression,
        write::{GzEncoder, ZlibEncoder},
    };
    use http::{
        HeaderMap, HeaderValue,
        header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH},
    };
    use lowband_config::CompressionConfig;
    use std::io::Write;

    const PLAIN: &[u8] = b"the quick brown fox jumps over the lazy dog, twice: the quick brown fox";

    fn negotiator() -> Negotiator {
        Negotiator::new(&CompressionConfig::default())
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("gzip write");
        enc.finish().expect("gzip finish")
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("zlib write");
        enc.finish().expect("zlib finish")
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            enc.write_all(data).expect("brotli write");
        }
        out
    }

    fn headers_with(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("123"));
        headers
    }

    #[test]
    fn advertise_replaces_caller_accept_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("zstd"));
        negotiator().advertise(&mut headers);
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "gzip, deflate, br");
    }

    #[test]
    fn decode_gzip_strips_encoding_headers() {
        let mut headers = headers_with("gzip");
        let out = negotiator()
            .decode(&mut headers, Bytes::from(gzip(PLAIN)))
            .expect("gzip decodes");
        assert_eq!(&out[..], PLAIN);
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn decode_brotli_and_deflate() {
        let mut headers = headers_with("br");
        let out = negotiator()
            .decode(&mut headers, Bytes::from(brotli(PLAIN)))
            .expect("br decodes");
        assert_eq!(&out[..], PLAIN);

        let mut headers = headers_with("deflate");
        let out = negotiator()
            .decode(&mut headers, Bytes::from(zlib(PLAIN)))
            .expect("deflate decodes");
        assert_eq!(&out[..], PLAIN);
    }

    #[test]
    fn decode_stacked_encodings_in_reverse_order() {
        let mut headers = headers_with("deflate, gzip");
        let body = gzip(&zlib(PLAIN));
        let out = negotiator()
            .decode(&mut headers, Bytes::from(body))
            .expect("stacked decodes");
        assert_eq!(&out[..], PLAIN);
    }

    #[test]
    fn decode_without_encoding_is_passthrough() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        let out = negotiator()
            .decode(&mut headers, Bytes::from_static(b"abc"))
            .expect("passthrough");
        assert_eq!(&out[..], b"abc");
        assert!(headers.get(CONTENT_LENGTH).is_some());
    }

    #[test]
    fn malformed_gzip_is_reported() {
        let mut headers = headers_with("gzip");
        let err = negotiator()
            .decode(&mut headers, Bytes::from_static(b"definitely not gzip"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { ref encoding, .. } if encoding == "gzip"));
    }

    #[test]
    fn unsupported_encoding_is_reported() {
        let mut headers = headers_with("zstd");
        let err = negotiator()
            .decode(&mut headers, Bytes::from_static(b"\x28\xb5\x2f\xfd"))
            .unwrap_err();
        assert_eq!(err, DecodeError::Unsupported("zstd".to_string()));
    }

    #[test]
    fn decoded_size_is_bounded() {
        let cfg = CompressionConfig {
            max_decoded_bytes: 8,
            ..CompressionConfig::default()
        };
        let mut headers = headers_with("gzip");
        let err = Negotiator::new(&cfg)
            .decode(&mut headers, Bytes::from(gzip(PLAIN)))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }
}
