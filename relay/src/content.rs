//! Content classification and recompression for relayed bodies.

use std::io::Write;
use std::path::Path;

use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

const UTF8_BOM: &[u8] = &[0xef, 0xbb, 0xbf];

/// Bodies at or below this size are never recompressed.
pub const RECOMPRESS_THRESHOLD: usize = 512;

/// Cheap sniff for compressed or otherwise non-text payloads.
///
/// Looks at the first line (at least 5 bytes of it) or the first 34 bytes,
/// whichever ends first. Any byte with the high bit set means binary unless
/// the buffer opens with a UTF-8 BOM.
pub fn is_binary(b: &[u8]) -> bool {
    if b.starts_with(UTF8_BOM) {
        return false;
    }
    for (i, &c) in b.iter().enumerate() {
        if c > 0x7f {
            return true;
        }
        if (c == b'\n' && i > 4) || i > 32 {
            break;
        }
    }
    false
}

/// Content types worth recompressing: html/plain text, ajax payloads and
/// form-encoded bodies some video APIs return.
pub fn is_text_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/x-javascript")
        || content_type.starts_with("application/javascript")
        || content_type.starts_with("application/x-www-form-urlencoded")
}

/// Whether the extension of `path` maps to a non-text MIME type.
/// No extension answers `false`; an unknown extension answers `true`.
pub fn extension_is_non_text(path: &str) -> bool {
    let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let mime = mime_guess::from_ext(ext)
        .first_raw()
        .unwrap_or_default();
    !is_text_content_type(mime)
}

/// Encoding chosen for an opportunistic recompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recompression {
    Deflate,
    Gzip,
}

impl Recompression {
    /// Pick from the caller's original `Accept-Encoding`; deflate wins.
    pub fn negotiate(accept_encoding: &str) -> Option<Self> {
        if accept_encoding.contains("deflate") {
            Some(Self::Deflate)
        } else if accept_encoding.contains("gzip") {
            Some(Self::Gzip)
        } else {
            None
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
        }
    }

    /// Compress with the best ratio.
    pub fn compress(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let out = Vec::with_capacity(data.len() / 2);
        match self {
            Self::Deflate => {
                let mut w = DeflateEncoder::new(out, Compression::best());
                w.write_all(data)?;
                w.finish()
            }
            Self::Gzip => {
                let mut w = GzEncoder::new(out, Compression::best());
                w.write_all(data)?;
                w.finish()
            }
        }
    }
}

/// Rewrite a `Range` value so the fetch stays under `maxsize`.
///
/// `bytes=S-E` keeps `E` unless the span exceeds `maxsize` or `E` is
/// missing, in which case the end becomes `S + maxsize`. Values that do not
/// parse are returned unchanged.
pub fn clamp_range(range: &str, maxsize: usize) -> String {
    let Some((_, bounds)) = range.split_once('=') else {
        return range.to_string();
    };
    let Some((start, end)) = bounds.split_once('-') else {
        return range.to_string();
    };
    let Ok(start) = start.trim().parse::<usize>() else {
        return range.to_string();
    };

    match end.trim().parse::<usize>() {
        Ok(end) if end.saturating_sub(start) <= maxsize => format!("bytes={start}-{end}"),
        _ => format!("bytes={}-{}", start, start.saturating_add(maxsize)),
    }
}
