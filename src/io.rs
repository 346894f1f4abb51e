use crate::kernel::vfs::FsError;

pub enum FillResult {
    Done(usize),
    Partial(usize),
    Full,
}

impl FillResult {
    pub fn ok_or(self, err: FsError) -> Result<(), FsError> {
        match self {
            FillResult::Done(_) => Ok(()),
            _ => Err(err),
        }
    }

    pub fn allow_partial(self) -> usize {
        match self {
            FillResult::Done(n) | FillResult::Partial(n) => n,
            FillResult::Full => 0,
        }
    }

    pub fn should_stop(&self) -> bool {
        !matches!(self, FillResult::Done(_))
    }
}

pub trait Buffer {
    fn total(&self) -> usize;
    fn wrote(&self) -> usize;
    fn fill(&mut self, data: &[u8]) -> Result<FillResult, FsError>;

    fn available(&self) -> usize {
        self.total() - self.wrote()
    }
}

pub struct ByteBuffer<'lt> {
    buf: &'lt mut [u8],
    cur: usize,
}

impl<'lt> ByteBuffer<'lt> {
    pub fn new(buf: &'lt mut [u8]) -> Self {
        Self { buf, cur: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.cur]
    }
}

impl Buffer for ByteBuffer<'_> {
    fn total(&self) -> usize {
        self.buf.len()
    }

    fn wrote(&self) -> usize {
        self.cur
    }

    fn fill(&mut self, data: &[u8]) -> Result<FillResult, FsError> {
        match self.available() {
            0 => Ok(FillResult::Full),
            n if n < data.len() => {
                self.buf[self.cur..].copy_from_slice(&data[..n]);
                self.cur += n;
                Ok(FillResult::Partial(n))
            }
            _ => {
                self.buf[self.cur..self.cur + data.len()].copy_from_slice(data);
                self.cur += data.len();
                Ok(FillResult::Done(data.len()))
            }
        }
    }
}

/// Copy from `src` into `dst`, starting at `offset` in `src`, at most
/// `count` bytes. Returns the number of bytes copied.
pub fn copy_offset_count(src: &[u8], dst: &mut [u8], offset: usize, count: usize) -> usize {
    if offset >= src.len() {
        return 0;
    }

    let count = {
        let count = count.min(dst.len());
        if offset + count > src.len() {
            src.len() - offset
        } else {
            count
        }
    };

    dst[..count].copy_from_slice(&src[offset..offset + count]);
    count
}
