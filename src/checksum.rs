//! Content hashing for manifest entries
//!
//! Files are always streamed through the hasher in bounded chunks, never
//! loaded whole.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Default read chunk for hashing (64KB)
pub const DEFAULT_HASH_BUFFER: usize = 64 * 1024;

/// Incremental MD5 over a byte stream, rendered as lowercase hex
pub struct ContentHasher {
    ctx: md5::Context,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything `reader` yields using a `buffer_size` scratch buffer
pub fn hash_reader<R: Read>(mut reader: R, buffer_size: usize) -> io::Result<String> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// Stream-hash a file on disk
pub fn hash_file(path: &Path, buffer_size: usize) -> io::Result<String> {
    let file = File::open(path)?;
    hash_reader(file, buffer_size)
}

/// Hex digests compare case-insensitively; manifests from other producers
/// may use uppercase.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
