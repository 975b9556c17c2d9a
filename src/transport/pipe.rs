//! In-process byte pipes backing the local transport.
//!
//! A pipe is an unbounded buffer with blocking reads: the reader parks
//! until bytes arrive or every writer is gone. The buffer must stay
//! unbounded: the fetch/push conversations write whole rounds before
//! reading, and a bounded buffer would deadlock two in-process peers
//! doing that.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Shared {
    buffer: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

struct Inner {
    shared: Mutex<Shared>,
    ready: Condvar,
}

/// Creates a connected reader/writer pair.
#[must_use]
pub fn pipe() -> (PipeReader, PipeWriter) {
    let inner = Arc::new(Inner {
        shared: Mutex::new(Shared::default()),
        ready: Condvar::new(),
    });
    (
        PipeReader {
            inner: Arc::clone(&inner),
        },
        PipeWriter { inner },
    )
}

/// Read half of an in-process pipe.
pub struct PipeReader {
    inner: Arc<Inner>,
}

/// Write half of an in-process pipe.
pub struct PipeWriter {
    inner: Arc<Inner>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut shared = self.inner.shared.lock().expect("pipe lock");
        loop {
            if !shared.buffer.is_empty() {
                let take = out.len().min(shared.buffer.len());
                for slot in out.iter_mut().take(take) {
                    *slot = shared.buffer.pop_front().expect("non-empty buffer");
                }
                return Ok(take);
            }
            if shared.writer_closed {
                return Ok(0);
            }
            shared = self.inner.ready.wait(shared).expect("pipe lock");
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock().expect("pipe lock");
        shared.reader_closed = true;
        self.inner.ready.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.inner.shared.lock().expect("pipe lock");
        if shared.reader_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader closed",
            ));
        }
        shared.buffer.extend(buf.iter().copied());
        self.inner.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock().expect("pipe lock");
        shared.writer_closed = true;
        self.inner.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_cross_threads() {
        let (mut reader, mut writer) = pipe();
        let producer = thread::spawn(move || {
            writer.write_all(b"hello across").unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, b"hello across");
    }

    #[test]
    fn read_after_writer_drop_sees_eof() {
        let (mut reader, writer) = pipe();
        drop(writer);
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).unwrap(), 0);
    }

    #[test]
    fn write_after_reader_drop_fails() {
        let (reader, mut writer) = pipe();
        drop(reader);
        assert!(writer.write_all(b"x").is_err());
    }
}
