use std::io::{Result, Write};

/// Trait representing positional writers that blobs can be dumped to.
///
/// Writers must support writing arbitrary byte slices at fixed offsets without
/// altering shared state; this is satisfied by `FileExt` handles on both Unix
/// and Windows.
pub trait MvMapWriter {
    /// Writes all of `data` at the given absolute `offset`.
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()>;
}

#[cfg(unix)]
impl<T: std::os::unix::fs::FileExt> MvMapWriter for T {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, data, offset)
    }
}

#[cfg(windows)]
impl<T: std::os::windows::fs::FileExt> MvMapWriter for T {
    fn write_all_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        while !data.is_empty() {
            let written = self.seek_write(data, offset)?;
            if written == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            data = &data[written..];
            offset += written as u64;
        }
        Ok(())
    }
}

/// Adapter implementing [`std::io::Write`] in terms of [`MvMapWriter`].
///
/// Each write lands at the next consecutive offset, starting from the offset
/// given at construction.
pub struct MvMapWriterWrapper<'a, W: MvMapWriter> {
    inner: &'a W,
    offset: u64,
}

impl<'a, W: MvMapWriter> MvMapWriterWrapper<'a, W> {
    pub fn new(inner: &'a W, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Offset at which the next write lands.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<W: MvMapWriter> Write for MvMapWriterWrapper<'_, W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
