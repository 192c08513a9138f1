//! Transparent compression for line-delimited files.
//!
//! Detection is extension-first with a magic-byte fallback for reads:
//! - **Gzip** (`.gz`, `.gzip`) via `flate2` (feature: `compression-gzip`)
//! - **Zstd** (`.zst`, `.zstd`) via `zstd` (feature: `compression-zstd`)
//!
//! File naming treats a compression suffix as part of a compound extension,
//! so `events.jsonl.gz` splits into the logical name `events` and the
//! extension `.jsonl.gz`. The split does not depend on which codecs are
//! compiled in, which keeps derived names stable across builds.

use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Suffixes recognised as compression, independent of enabled features.
pub const COMPRESSION_SUFFIXES: &[&str] = &[".gz", ".gzip", ".zst", ".zstd"];

/// Split a file name into `(logical_name, extension)`.
///
/// The extension is the last dotted segment, or the last two when the final
/// one is a compression suffix. A leading dot does not start an extension.
#[must_use]
pub fn split_file_name(file_name: &str) -> (String, String) {
    let last_dot = |s: &str| s.rfind('.').filter(|&i| i > 0);
    let Some(i) = last_dot(file_name) else {
        return (file_name.to_string(), String::new());
    };
    let suffix = file_name[i..].to_ascii_lowercase();
    let cut = if COMPRESSION_SUFFIXES.contains(&suffix.as_str()) {
        last_dot(&file_name[..i]).unwrap_or(i)
    } else {
        i
    };
    (file_name[..cut].to_string(), file_name[cut..].to_string())
}

/// Whether a path or extension names a compressed file.
#[must_use]
pub fn is_compressed(path: impl AsRef<Path>) -> bool {
    let lower = path.as_ref().to_string_lossy().to_ascii_lowercase();
    COMPRESSION_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// A compiled-in compression codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    #[cfg(feature = "compression-gzip")]
    Gzip,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl Codec {
    /// Every codec available in this build.
    pub const ALL: &'static [Codec] = &[
        #[cfg(feature = "compression-gzip")]
        Codec::Gzip,
        #[cfg(feature = "compression-zstd")]
        Codec::Zstd,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => "zstd",
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => &[".gz", ".gzip"],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[".zst", ".zstd"],
        }
    }

    fn magic(self) -> &'static [u8] {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => &[0x1f, 0x8b],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
        }
    }

    /// Codec selected by the path's extension.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Option<Codec> {
        let lower = path.as_ref().to_string_lossy().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.extensions().iter().any(|ext| lower.ends_with(ext)))
    }

    fn from_magic(head: &[u8]) -> Option<Codec> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| !head.is_empty() && head.starts_with(c.magic()))
    }

    fn wrap_reader(self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Ok(Box::new(zstd::stream::read::Decoder::new(reader)?)),
        }
    }
}

/// Wrap a reader for line-oriented reading, decompressing when the path hint
/// or the leading bytes indicate a known codec.
///
/// # Errors
///
/// Returns an error if the decompressor cannot be initialised.
pub fn decompressing_reader<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn BufRead + Send>> {
    if let Some(codec) = Codec::from_path(&path_hint) {
        let inner = codec
            .wrap_reader(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()))?;
        return Ok(Box::new(BufReader::new(inner)));
    }
    let mut buffered = BufReader::new(reader);
    let head = buffered.fill_buf().map(<[u8]>::to_vec).unwrap_or_default();
    if let Some(codec) = Codec::from_magic(&head) {
        let inner = codec
            .wrap_reader(Box::new(buffered))
            .with_context(|| format!("wrap reader with {} codec", codec.name()))?;
        return Ok(Box::new(BufReader::new(inner)));
    }
    Ok(Box::new(buffered))
}

/// A buffered writer that compresses according to the destination name.
///
/// Call [`CompressedWriter::finish`] to write codec trailers and recover the
/// underlying writer; dropping without finishing may truncate the stream.
pub enum CompressedWriter<W: Write> {
    Plain(BufWriter<W>),
    #[cfg(feature = "compression-gzip")]
    Gzip(flate2::write::GzEncoder<BufWriter<W>>),
    #[cfg(feature = "compression-zstd")]
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<W>>),
}

impl<W: Write> CompressedWriter<W> {
    /// Choose the codec from `path_hint`'s extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the compressor cannot be initialised.
    pub fn new(writer: W, path_hint: impl AsRef<Path>) -> io::Result<Self> {
        let buffered = BufWriter::new(writer);
        Ok(match Codec::from_path(path_hint) {
            None => Self::Plain(buffered),
            #[cfg(feature = "compression-gzip")]
            Some(Codec::Gzip) => Self::Gzip(flate2::write::GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            )),
            #[cfg(feature = "compression-zstd")]
            Some(Codec::Zstd) => Self::Zstd(zstd::stream::write::Encoder::new(buffered, 3)?),
        })
    }

    /// Flush codec state and return the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn finish(self) -> io::Result<W> {
        let buffered = match self {
            Self::Plain(w) => w,
            #[cfg(feature = "compression-gzip")]
            Self::Gzip(enc) => enc.finish()?,
            #[cfg(feature = "compression-zstd")]
            Self::Zstd(enc) => enc.finish()?,
        };
        buffered.into_inner().map_err(io::IntoInnerError::into_error)
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            #[cfg(feature = "compression-gzip")]
            Self::Gzip(w) => w.write(buf),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            #[cfg(feature = "compression-gzip")]
            Self::Gzip(w) => w.flush(),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd(w) => w.flush(),
        }
    }
}
