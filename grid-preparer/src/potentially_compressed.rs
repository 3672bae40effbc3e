use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::instrumented_reader;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER_SIZE: usize = 1 << 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Gzip,
}

impl CompressionType {
    /// Sniffs the first bytes of a stream.
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            CompressionType::Gzip
        } else {
            CompressionType::None
        }
    }

    /// Compression implied by a file name when writing.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => CompressionType::Gzip,
            _ => CompressionType::None,
        }
    }
}

/// Wraps `stream` in a gzip decoder if it starts with the gzip magic bytes.
/// Nothing is consumed while sniffing.
pub fn decompressed<R>(mut stream: R) -> io::Result<Box<dyn BufRead + Send>>
where
    R: BufRead + Send + 'static,
{
    let kind = CompressionType::detect(stream.fill_buf()?);
    debug!(?kind, "detected compression");
    Ok(match kind {
        CompressionType::Gzip => Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            MultiGzDecoder::new(stream),
        )),
        CompressionType::None => Box::new(stream),
    })
}

/// Opens a possibly gzip-compressed file, logging read progress on the raw
/// bytes.
pub fn open(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let progress = instrumented_reader::logging(file, path.display().to_string());
    decompressed(BufReader::with_capacity(READ_BUFFER_SIZE, progress))
}

/// Output file, gzip-compressed when its name ends in `.gz`. Call
/// [`Output::finish`] to flush and write the gzip trailer.
pub enum Output {
    Uncompressed(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Output {
    pub fn finish(self) -> io::Result<()> {
        match self {
            Output::Uncompressed(mut file) => file.flush(),
            Output::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Uncompressed(file) => file.write(buf),
            Output::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Uncompressed(file) => file.flush(),
            Output::Gzip(encoder) => encoder.flush(),
        }
    }
}

pub fn create(path: &Path) -> io::Result<Output> {
    let file = BufWriter::new(File::create(path)?);
    Ok(match CompressionType::for_path(path) {
        CompressionType::Gzip => Output::Gzip(GzEncoder::new(file, flate2::Compression::default())),
        CompressionType::None => Output::Uncompressed(file),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn detects_gzip_magic() {
        assert_eq!(CompressionType::detect(&gzip(b"x")), CompressionType::Gzip);
        assert_eq!(CompressionType::detect(b"pentad,7"), CompressionType::None);
        assert_eq!(CompressionType::detect(b""), CompressionType::None);
    }

    #[test]
    fn plain_and_gzip_streams_read_the_same() {
        let text = b"species\tdecimalLatitude\nBubo africanus\t-33.9\n";
        for bytes in [text.to_vec(), gzip(text)] {
            let mut out = String::new();
            decompressed(Cursor::new(bytes))
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            assert_eq!(out.as_bytes(), text);
        }
    }

    #[test]
    fn round_trips_through_gz_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv.gz");
        let mut out = create(&path).unwrap();
        out.write_all(b"a,b\n1,2\n").unwrap();
        out.finish().unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(CompressionType::detect(&raw), CompressionType::Gzip);

        let mut text = String::new();
        open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "a,b\n1,2\n");
    }
}
