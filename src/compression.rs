//! Compression Codecs
//!
//! A closed set of schemes, each bound once to a streaming encoder
//! (write, then [`Encoder::finish`]) and a streaming decoder (read to
//! completion). Call sites only ever see [`CompressionKind`], [`Encoder`]
//! and [`Decoder`]; adding a scheme means adding one variant to each.
//!
//! | Tag      | Encoder                      | Decoder                     |
//! |----------|------------------------------|-----------------------------|
//! | `gzip`   | `flate2::write::GzEncoder`   | `flate2::read::GzDecoder`   |
//! | `zlib`   | `flate2::write::ZlibEncoder` | `flate2::read::ZlibDecoder` |
//! | `snappy` | `snap::write::FrameEncoder`  | `snap::read::FrameDecoder`  |

use std::fmt;
use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Compression scheme tag carried in packet metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Gzip,
    Zlib,
    #[default]
    Snappy,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 3] = [
        CompressionKind::Gzip,
        CompressionKind::Zlib,
        CompressionKind::Snappy,
    ];

    /// Resolve a scheme tag. Empty or unrecognized tags fall back to snappy.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "gzip" => CompressionKind::Gzip,
            "zlib" => CompressionKind::Zlib,
            "snappy" => CompressionKind::Snappy,
            other => {
                warn!("Unknown compression type {:?}, falling back to snappy", other);
                CompressionKind::Snappy
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionKind::Gzip => "gzip",
            CompressionKind::Zlib => "zlib",
            CompressionKind::Snappy => "snappy",
        }
    }

    /// Wrap `sink` in this scheme's encoder
    pub fn encoder<W: Write>(self, sink: W) -> Encoder<W> {
        match self {
            CompressionKind::Gzip => Encoder::Gzip(GzEncoder::new(sink, Compression::default())),
            CompressionKind::Zlib => {
                Encoder::Zlib(ZlibEncoder::new(sink, Compression::default()))
            }
            CompressionKind::Snappy => Encoder::Snappy(snap::write::FrameEncoder::new(sink)),
        }
    }

    /// Wrap `source` in this scheme's decoder
    pub fn decoder<R: Read>(self, source: R) -> Decoder<R> {
        match self {
            CompressionKind::Gzip => Decoder::Gzip(GzDecoder::new(source)),
            CompressionKind::Zlib => Decoder::Zlib(ZlibDecoder::new(source)),
            CompressionKind::Snappy => Decoder::Snappy(snap::read::FrameDecoder::new(source)),
        }
    }

    /// Compress a whole buffer
    pub fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = self.encoder(Vec::new());
        encoder.write_all(data)?;
        encoder.finish()
    }

    /// Decompress a whole buffer
    pub fn decompress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decoder(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming encoder over any sink
pub enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Snappy(snap::write::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Flush trailing state and hand back the sink
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(encoder) => encoder.finish(),
            Encoder::Zlib(encoder) => encoder.finish(),
            Encoder::Snappy(encoder) => encoder
                .into_inner()
                .map_err(|e| io::Error::new(e.error().kind(), e.to_string())),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(encoder) => encoder.write(buf),
            Encoder::Zlib(encoder) => encoder.write(buf),
            Encoder::Snappy(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(encoder) => encoder.flush(),
            Encoder::Zlib(encoder) => encoder.flush(),
            Encoder::Snappy(encoder) => encoder.flush(),
        }
    }
}

/// Streaming decoder over any source
pub enum Decoder<R: Read> {
    Gzip(GzDecoder<R>),
    Zlib(ZlibDecoder<R>),
    Snappy(snap::read::FrameDecoder<R>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Gzip(decoder) => decoder.read(buf),
            Decoder::Zlib(decoder) => decoder.read(buf),
            Decoder::Snappy(decoder) => decoder.read(buf),
        }
    }
}
