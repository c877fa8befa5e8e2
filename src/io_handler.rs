//! Output capture for limited commands.
//!
//! [`CaptureBuffer`] keeps the first and last `N` bytes of a stream so that
//! diagnostic output can be attached to errors without holding the whole
//! stream in memory. [`spawn_copier`] drains a child pipe into any writer on
//! a dedicated thread while the caller waits for the process.
use std::io::{self, Read, Write};
use std::thread;

/// Bytes of stderr retained at each end of a captured stream (32 KiB)
pub const DEFAULT_CAPTURE_LIMIT: usize = 32 << 10;

/// Writer that retains the first `N` and the last `N` bytes written to it
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    limit: usize,
    prefix: Vec<u8>,
    /// Ring buffer once it holds `limit` bytes
    suffix: Vec<u8>,
    suffix_off: usize,
    skipped: u64,
}

impl CaptureBuffer {
    /// Create a buffer keeping `limit` bytes at each end
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            prefix: Vec::new(),
            suffix: Vec::new(),
            suffix_off: 0,
            skipped: 0,
        }
    }

    /// Number of bytes dropped between the prefix and the suffix
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Retention limit for each end
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reconstruct the retained output, marking any omitted middle section
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.suffix.is_empty() {
            return self.prefix.clone();
        }
        if self.skipped == 0 {
            let mut out = Vec::with_capacity(self.prefix.len() + self.suffix.len());
            out.extend_from_slice(&self.prefix);
            out.extend_from_slice(&self.suffix);
            return out;
        }

        let marker = format!("\n... omitting {} bytes ...\n", self.skipped);
        let mut out = Vec::with_capacity(self.prefix.len() + marker.len() + self.suffix.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(marker.as_bytes());
        out.extend_from_slice(&self.suffix[self.suffix_off..]);
        out.extend_from_slice(&self.suffix[..self.suffix_off]);
        out
    }

    /// Append as much of `data` to `dst` as fits under the limit, returning the rest
    fn fill<'a>(limit: usize, dst: &mut Vec<u8>, data: &'a [u8]) -> &'a [u8] {
        let room = limit.saturating_sub(dst.len());
        let take = room.min(data.len());
        dst.extend_from_slice(&data[..take]);
        &data[take..]
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_LIMIT)
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        if self.limit == 0 {
            self.skipped += total as u64;
            return Ok(total);
        }
        let mut rest = Self::fill(self.limit, &mut self.prefix, buf);

        // Only the last `limit` bytes of this chunk can survive
        if rest.len() > self.limit {
            let overage = rest.len() - self.limit;
            rest = &rest[overage..];
            self.skipped += overage as u64;
        }
        rest = Self::fill(self.limit, &mut self.suffix, rest);

        // Suffix is full; overwrite it circularly. At most two passes.
        while !rest.is_empty() {
            let end = (self.suffix_off + rest.len()).min(self.limit);
            let n = end - self.suffix_off;
            self.suffix[self.suffix_off..end].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            self.skipped += n as u64;
            self.suffix_off = end % self.limit;
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy everything from `reader` into `writer` on a new thread, handing the writer back
pub fn spawn_copier<R, W>(mut reader: R, mut writer: W) -> thread::JoinHandle<io::Result<W>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let copied = io::copy(&mut reader, &mut writer)?;
        log::debug!("Copied {} bytes of child output", copied);
        Ok(writer)
    })
}

/// Wait for a copier thread started with [`spawn_copier`]
pub fn join_copier<W>(handle: thread::JoinHandle<io::Result<W>>) -> io::Result<W> {
    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output copier thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn write_in_chunks(buf: &mut CaptureBuffer, data: &[u8], chunk: usize) {
        for piece in data.chunks(chunk) {
            assert_eq!(buf.write(piece).unwrap(), piece.len());
        }
    }

    #[test]
    fn test_small_output_is_verbatim() {
        let mut buf = CaptureBuffer::new(8);
        buf.write_all(b"hello").unwrap();
        assert_eq!(buf.to_bytes(), b"hello");
        assert_eq!(buf.skipped(), 0);
    }

    #[test]
    fn test_empty_buffer() {
        let buf = CaptureBuffer::new(8);
        assert!(buf.to_bytes().is_empty());
    }

    #[test]
    fn test_up_to_twice_the_limit_round_trips() {
        let limit = 16;
        for len in [0, 1, 15, 16, 17, 31, 32] {
            for chunk in [1, 3, 7, 64] {
                let data = pattern(len);
                let mut buf = CaptureBuffer::new(limit);
                write_in_chunks(&mut buf, &data, chunk);
                assert_eq!(buf.to_bytes(), data, "len {} chunk {}", len, chunk);
                assert_eq!(buf.skipped(), 0);
            }
        }
    }

    #[test]
    fn test_truncation_keeps_both_ends() {
        let limit = 16;
        for extra in [1usize, 5, 16, 17, 100] {
            for chunk in [1, 4, 9, 1000] {
                let data = pattern(2 * limit + extra);
                let mut buf = CaptureBuffer::new(limit);
                write_in_chunks(&mut buf, &data, chunk);

                let mut expected = data[..limit].to_vec();
                expected.extend_from_slice(
                    format!("\n... omitting {} bytes ...\n", extra).as_bytes(),
                );
                expected.extend_from_slice(&data[data.len() - limit..]);

                assert_eq!(buf.skipped(), extra as u64);
                assert_eq!(buf.to_bytes(), expected, "extra {} chunk {}", extra, chunk);
            }
        }
    }

    #[test]
    fn test_write_reports_full_length() {
        let mut buf = CaptureBuffer::new(4);
        assert_eq!(buf.write(&pattern(1000)).unwrap(), 1000);
        assert_eq!(buf.skipped(), 992);
        assert!(buf.to_bytes().len() <= 8 + "\n... omitting 992 bytes ...\n".len());
    }

    #[test]
    fn test_copier_returns_writer() {
        let data = pattern(100_000);
        let handle = spawn_copier(io::Cursor::new(data.clone()), CaptureBuffer::new(1024));
        let buf = join_copier(handle).unwrap();

        let out = buf.to_bytes();
        assert!(out.starts_with(&data[..1024]));
        assert!(out.ends_with(&data[data.len() - 1024..]));
        assert_eq!(buf.skipped(), (data.len() - 2048) as u64);
    }
}
