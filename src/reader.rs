use std::io::Result;

/// Trait abstracting positional read access to stored blobs.
///
/// Implementations must support positional reads without mutating shared state.
/// The trait is blanket-implemented for platform-specific `FileExt` handles.
pub trait MvMapReader {
    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    ///
    /// Implementations should return an error whenever the requested range
    /// cannot be satisfied in full.
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>;

    /// Reads `length` bytes starting at `offset` into an owned buffer.
    fn read_vec_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.read_exact_at(offset, length, |data| Ok(data.to_vec()))
    }
}

#[cfg(unix)]
impl<T: std::os::unix::fs::FileExt> MvMapReader for T {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let mut buffer = vec![0u8; length as usize];
        std::os::unix::fs::FileExt::read_exact_at(self, &mut buffer, offset)?;
        f(&buffer)
    }

    fn read_vec_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length as usize];
        std::os::unix::fs::FileExt::read_exact_at(self, &mut buffer, offset)?;
        Ok(buffer)
    }
}

#[cfg(windows)]
impl<T: std::os::windows::fs::FileExt> MvMapReader for T {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let bytes = self.seek_read(&mut buffer[filled..], offset + filled as u64)?;
            if bytes == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Failed to read enough bytes",
                ));
            }
            filled += bytes;
        }
        f(&buffer)
    }
}
