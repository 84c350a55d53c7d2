use std::{
    collections::VecDeque,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use gfdt::{Error, File, FileOps, FileType, OpenFlags, PollEvents, Result, files};
use log::info;

fn usage() -> ! {
    eprintln!("gfdt-stress [threads] [rounds]");
    std::process::exit(1);
}

/// An in-memory pipe, counting how often it is closed.
struct Pipe {
    buf: VecDeque<u8>,
    closes: Arc<AtomicUsize>,
}

struct PipeOps;

static PIPE_OPS: PipeOps = PipeOps;

impl FileOps for PipeOps {
    fn read(&self, fp: &File, buf: &mut [u8], _offset: Option<u64>) -> Result<usize> {
        let mut state = fp.lock();
        let pipe = state.data_mut::<Pipe>().ok_or(Error::BadDescriptor)?;
        let count = pipe.buf.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(pipe.buf.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn write(&self, fp: &File, buf: &[u8], _offset: Option<u64>) -> Result<usize> {
        {
            let mut state = fp.lock();
            let pipe = state.data_mut::<Pipe>().ok_or(Error::BadDescriptor)?;
            pipe.buf.extend(buf);
        }
        fp.poll_wake(PollEvents::IN);
        Ok(buf.len())
    }

    fn poll(&self, fp: &File, events: PollEvents) -> PollEvents {
        let state = fp.lock();
        match state.data::<Pipe>() {
            Some(pipe) if !pipe.buf.is_empty() => (PollEvents::IN | PollEvents::OUT) & events,
            Some(_) => PollEvents::OUT & events,
            None => PollEvents::NVAL,
        }
    }

    fn close(&self, fp: &File) -> Result<()> {
        let state = fp.lock();
        let pipe = state.data::<Pipe>().ok_or(Error::BadDescriptor)?;
        pipe.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn round(closes: &Arc<AtomicUsize>) -> Result<()> {
    let pipe = Pipe {
        buf: VecDeque::new(),
        closes: Arc::clone(closes),
    };
    let (fp, fd) = files().falloc(
        OpenFlags::READ | OpenFlags::WRITE,
        FileType::Pipe,
        pipe,
        &PIPE_OPS,
    )?;

    let (dup_fp, dup_fd) = match files().dup(fd) {
        Ok(dup) => dup,
        Err(err) => {
            files().close(fd, fp);
            return Err(err);
        }
    };

    let res = files()
        .with_file(fd, |file| file.write(b"stress", None))
        .and_then(|_| {
            let mut buf = [0u8; 16];
            files().with_file(dup_fd, |file| file.read(&mut buf, None))
        });

    files().close(fd, fp);
    files().close(dup_fd, dup_fp);
    res.map(|_| ())
}

fn main() {
    env_logger::init();

    let mut threads = None;
    let mut rounds = None;
    for arg in std::env::args().skip(1) {
        let value = match arg.parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => {
                eprintln!("gfdt-stress: invalid count '{}'", arg);
                usage();
            }
        };
        if threads.is_none() {
            threads = Some(value);
        } else if rounds.is_none() {
            rounds = Some(value);
        } else {
            eprintln!("gfdt-stress: too many arguments");
            usage();
        }
    }
    let threads = threads.unwrap_or(8);
    let rounds = rounds.unwrap_or(10_000);

    info!(
        "running {} threads x {} rounds against a table of {} slots",
        threads,
        rounds,
        files().capacity()
    );

    let closes = Arc::new(AtomicUsize::new(0));
    let failures = AtomicUsize::new(0);
    let barrier = Barrier::new(threads);
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..rounds {
                    if let Err(err) = round(&closes) {
                        log::warn!("round failed: {}", err);
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let opened = threads * rounds;
    let closed = closes.load(Ordering::Relaxed);
    let failed = failures.load(Ordering::Relaxed);
    eprintln!(
        "gfdt-stress: {} files opened, {} finalized, {} rounds failed, {} slots still occupied",
        opened,
        closed,
        failed,
        files().occupied()
    );

    if closed != opened || files().occupied() != 0 {
        eprintln!("gfdt-stress: lifecycle mismatch");
        std::process::exit(1);
    }
}
