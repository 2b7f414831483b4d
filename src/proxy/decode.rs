use std::io::Write;

use anyhow::{Result, bail};
use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};

/// Incremental decoder for origin response bodies. The proxy always stores
/// and serves decoded bytes, so a `Content-Encoding` the decoder does not
/// understand fails the fetch rather than passing opaque bytes through.
pub(crate) enum ContentDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl ContentDecoder {
    pub(crate) fn for_encoding(encoding: Option<&str>) -> Result<Self> {
        match encoding.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Ok(Self::Identity),
            Some("gzip") | Some("x-gzip") => Ok(Self::Gzip(GzDecoder::new(Vec::new()))),
            Some("deflate") => Ok(Self::Deflate(ZlibDecoder::new(Vec::new()))),
            Some(other) => bail!("unsupported content-encoding: {other}"),
        }
    }

    pub(crate) fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Feeds compressed input and returns whatever decoded bytes became
    /// available. Identity passes the input through untouched.
    pub(crate) fn push(&mut self, input: Bytes) -> Result<Bytes> {
        match self {
            Self::Identity => Ok(input),
            Self::Gzip(decoder) => {
                decoder.write_all(&input)?;
                decoder.flush()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            Self::Deflate(decoder) => {
                decoder.write_all(&input)?;
                decoder.flush()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    /// Finalizes the stream and returns any remaining decoded bytes. Errors
    /// when the compressed stream was truncated.
    pub(crate) fn finish(self) -> Result<Bytes> {
        match self {
            Self::Identity => Ok(Bytes::new()),
            Self::Gzip(decoder) => Ok(Bytes::from(decoder.finish()?)),
            Self::Deflate(decoder) => Ok(Bytes::from(decoder.finish()?)),
        }
    }
}
