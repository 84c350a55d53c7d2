use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{Error, Result},
    file::{File, FileOps, FileStat},
    poll::PollEvents,
};

/// Counts hook invocations, shared between a test and the file under test.
#[derive(Debug, Default)]
pub struct Counters {
    init: AtomicUsize,
    close: AtomicUsize,
}

impl Counters {
    pub fn inits(&self) -> usize {
        self.init.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.close.load(Ordering::SeqCst)
    }
}

/// An in-memory regular file.
#[derive(Default)]
pub struct Mock {
    pub counters: Arc<Counters>,
    pub contents: Vec<u8>,
    pub mode: u32,
    pub ready: PollEvents,
    pub fail_init: bool,
}

impl Mock {
    pub fn with_counters(counters: &Arc<Counters>) -> Self {
        Self {
            counters: Arc::clone(counters),
            ..Self::default()
        }
    }

    pub fn with_ready(mut self, ready: PollEvents) -> Self {
        self.ready = ready;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }
}

pub struct MockOps;

pub static MOCK_OPS: MockOps = MockOps;

impl FileOps for MockOps {
    fn init(&self, fp: &File) -> Result<()> {
        let state = fp.lock();
        let mock = state.data::<Mock>().ok_or(Error::BadDescriptor)?;
        mock.counters.init.fetch_add(1, Ordering::SeqCst);
        if mock.fail_init {
            return Err(Error::Errno(libc::EIO));
        }
        Ok(())
    }

    fn read(&self, fp: &File, buf: &mut [u8], offset: Option<u64>) -> Result<usize> {
        let mut state = fp.lock();
        let pos = offset.unwrap_or(state.offset) as usize;
        let mock = state.data::<Mock>().ok_or(Error::BadDescriptor)?;
        let available = mock.contents.get(pos..).unwrap_or_default();
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        if offset.is_none() {
            state.offset += count as u64;
        }
        Ok(count)
    }

    fn write(&self, fp: &File, buf: &[u8], offset: Option<u64>) -> Result<usize> {
        let mut state = fp.lock();
        let pos = offset.unwrap_or(state.offset) as usize;
        let mock = state.data_mut::<Mock>().ok_or(Error::BadDescriptor)?;
        let end = pos + buf.len();
        if mock.contents.len() < end {
            mock.contents.resize(end, 0);
        }
        mock.contents[pos..end].copy_from_slice(buf);
        if offset.is_none() {
            state.offset = end as u64;
        }
        Ok(buf.len())
    }

    fn truncate(&self, fp: &File, len: u64) -> Result<()> {
        let mut state = fp.lock();
        let mock = state.data_mut::<Mock>().ok_or(Error::BadDescriptor)?;
        mock.contents.resize(len as usize, 0);
        Ok(())
    }

    fn poll(&self, fp: &File, events: PollEvents) -> PollEvents {
        let state = fp.lock();
        state
            .data::<Mock>()
            .map_or(PollEvents::NVAL, |mock| mock.ready & events)
    }

    fn stat(&self, fp: &File) -> Result<FileStat> {
        let state = fp.lock();
        let mock = state.data::<Mock>().ok_or(Error::BadDescriptor)?;
        Ok(FileStat {
            mode: mock.mode,
            size: mock.contents.len() as u64,
            block_size: 512,
        })
    }

    fn close(&self, fp: &File) -> Result<()> {
        let state = fp.lock();
        let mock = state.data::<Mock>().ok_or(Error::BadDescriptor)?;
        mock.counters.close.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn chmod(&self, fp: &File, mode: u32) -> Result<()> {
        let mut state = fp.lock();
        let mock = state.data_mut::<Mock>().ok_or(Error::BadDescriptor)?;
        mock.mode = mode;
        Ok(())
    }
}
