//! Stream compression codecs for cached volume archives.

use async_compression::Level;
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use conveyor_core::{Error, Result, TarStream};
use tokio::io::BufReader;

/// Codec applied to a volume's tar stream before it reaches the object
/// store. `Zstd` with level 0 uses the encoder default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd { level: i32 },
    Gzip,
    None,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 0 }
    }
}

impl Compression {
    /// Parse the `cache_compression` DSN parameter.
    pub fn from_param(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("zstd") => Ok(Compression::Zstd { level: 0 }),
            Some("gzip") => Ok(Compression::Gzip),
            Some("none") => Ok(Compression::None),
            Some(other) => Err(Error::Validation(format!(
                "unknown cache_compression {other:?} (expected zstd, gzip, or none)"
            ))),
        }
    }

    /// File extension of the persisted object, including the tar suffix.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Zstd { .. } => "tar.zst",
            Compression::Gzip => "tar.gz",
            Compression::None => "tar",
        }
    }

    /// Wrap `data` so reads yield the compressed byte stream.
    pub fn compress(&self, data: TarStream) -> TarStream {
        match self {
            Compression::Zstd { level } => {
                let quality = if *level == 0 {
                    Level::Default
                } else {
                    Level::Precise(*level)
                };
                Box::new(ZstdEncoder::with_quality(BufReader::new(data), quality))
            }
            Compression::Gzip => Box::new(GzipEncoder::new(BufReader::new(data))),
            Compression::None => data,
        }
    }

    /// Wrap a persisted object stream so reads yield the original tar.
    pub fn decompress(&self, data: TarStream) -> TarStream {
        match self {
            Compression::Zstd { .. } => Box::new(ZstdDecoder::new(BufReader::new(data))),
            Compression::Gzip => Box::new(GzipDecoder::new(BufReader::new(data))),
            Compression::None => data,
        }
    }
}
