//! Blocking single-writer/single-reader byte pipe.
//!
//! Carries a request body from the embedding caller (writing as bytes become
//! available) to the HTTP execution layer (reading while the request is
//! streamed), without buffering the whole body up front. Storage is a grown
//! list of fixed-size blocks with a read cursor, a write cursor, and a
//! completion flag; all mutation happens under one lock, and the reader
//! parks on a condvar until bytes or completion arrive.
//!
//! The write side is never throttled: the block list grows without bound if
//! the writer outpaces the reader. That is an accepted memory-growth risk,
//! not an enforced limit.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// Size of one storage block.
pub const BLOCK_LEN: usize = 8192;

struct PipeState {
    blocks: Vec<Vec<u8>>,
    read_block: usize,
    read_off: usize,
    write_block: usize,
    write_off: usize,
    done: bool,
}

impl PipeState {
    fn has_unread(&self) -> bool {
        self.read_block < self.write_block || self.read_off < self.write_off
    }
}

/// The pipe itself. Wrap in an [`Arc`] and hand [`writer`](BytePipe::writer)
/// to the producing thread and [`reader`](BytePipe::reader) (or
/// [`read_chunk`](BytePipe::read_chunk)) to the consuming thread.
///
/// Exactly one writer thread and one reader thread are supported.
pub struct BytePipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Default for BytePipe {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePipe {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                blocks: vec![vec![0u8; BLOCK_LEN]],
                read_block: 0,
                read_off: 0,
                write_block: 0,
                write_off: 0,
                done: false,
            }),
            readable: Condvar::new(),
        }
    }

    /// Write handle for the producing side.
    pub fn writer(self: &Arc<Self>) -> PipeWriter {
        PipeWriter { pipe: Arc::clone(self) }
    }

    /// Read handle for the consuming side.
    pub fn reader(self: &Arc<Self>) -> PipeReader {
        PipeReader { pipe: Arc::clone(self) }
    }

    /// Append bytes to the stream. Never blocks.
    fn push(&self, mut buf: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.done {
            // Writes after completion are discarded.
            return;
        }
        while !buf.is_empty() {
            if state.write_off >= BLOCK_LEN {
                state.write_off = 0;
                state.write_block += 1;
                state.blocks.push(vec![0u8; BLOCK_LEN]);
            }
            let n = buf.len().min(BLOCK_LEN - state.write_off);
            let (block, off) = (state.write_block, state.write_off);
            state.blocks[block][off..off + n].copy_from_slice(&buf[..n]);
            state.write_off += n;
            buf = &buf[n..];
        }
        drop(state);
        self.readable.notify_all();
    }

    /// Signal end of data. Bytes written before this call remain readable;
    /// once they are drained the stream reports exhaustion.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        drop(state);
        self.readable.notify_all();
    }

    /// Read up to `buf.len()` bytes, blocking while no unread byte exists
    /// and completion has not been signaled. Returns 0 only at end of
    /// stream, and keeps returning 0 thereafter.
    pub fn read_chunk(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut state = self.state.lock().unwrap();
        loop {
            if state.has_unread() {
                if state.read_off >= BLOCK_LEN {
                    state.read_off = 0;
                    state.read_block += 1;
                }
                let avail = if state.read_block == state.write_block {
                    state.write_off - state.read_off
                } else {
                    BLOCK_LEN - state.read_off
                };
                if avail == 0 {
                    // Cursor parked at a block boundary; loop to advance.
                    continue;
                }
                let n = avail.min(buf.len());
                let (block, off) = (state.read_block, state.read_off);
                buf[..n].copy_from_slice(&state.blocks[block][off..off + n]);
                state.read_off += n;
                return n;
            }
            if state.done {
                return 0;
            }
            // Re-checks the condition after waking; tolerates spurious wakeups.
            state = self.readable.wait(state).unwrap();
        }
    }
}

/// Writer half of a [`BytePipe`]. Signals completion on drop, so a writer
/// abandoned mid-body still unblocks the reader.
pub struct PipeWriter {
    pipe: Arc<BytePipe>,
}

impl PipeWriter {
    /// Mark the body complete. Idempotent.
    pub fn finish(&self) {
        self.pipe.finish();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pipe.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.pipe.finish();
    }
}

/// Reader half of a [`BytePipe`].
pub struct PipeReader {
    pipe: Arc<BytePipe>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.pipe.read_chunk(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_round_trip_single_block() {
        let pipe = Arc::new(BytePipe::new());
        let mut writer = pipe.writer();
        writer.write_all(b"hello pipe").unwrap();
        writer.finish();

        let mut buf = [0u8; 64];
        let n = pipe.read_chunk(&mut buf);
        assert_eq!(&buf[..n], b"hello pipe");
        assert_eq!(pipe.read_chunk(&mut buf), 0);
    }

    #[test]
    fn test_round_trip_spanning_blocks() {
        let pipe = Arc::new(BytePipe::new());
        let payload: Vec<u8> = (0..3 * BLOCK_LEN + 17).map(|i| (i % 251) as u8).collect();

        let mut writer = pipe.writer();
        writer.write_all(&payload).unwrap();
        writer.finish();

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = pipe.read_chunk(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn test_eof_is_sticky() {
        let pipe = Arc::new(BytePipe::new());
        pipe.writer().finish();
        let mut buf = [0u8; 8];
        assert_eq!(pipe.read_chunk(&mut buf), 0);
        assert_eq!(pipe.read_chunk(&mut buf), 0);
    }

    #[test]
    fn test_reader_blocks_until_write() {
        let pipe = Arc::new(BytePipe::new());
        let reader_pipe = Arc::clone(&pipe);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = reader_pipe.read_chunk(&mut buf);
            buf[..n].to_vec()
        });

        thread::sleep(Duration::from_millis(50));
        let mut writer = pipe.writer();
        writer.write_all(b"late").unwrap();
        writer.finish();

        assert_eq!(handle.join().unwrap(), b"late");
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let pipe = Arc::new(BytePipe::new());
        let writer_pipe = Arc::clone(&pipe);
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        let expected = payload.clone();

        let writer = thread::spawn(move || {
            let mut w = writer_pipe.writer();
            for chunk in payload.chunks(777) {
                w.write_all(chunk).unwrap();
            }
            w.finish();
        });

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = pipe.read_chunk(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_dropped_writer_unblocks_reader() {
        let pipe = Arc::new(BytePipe::new());
        {
            let mut writer = pipe.writer();
            writer.write_all(b"partial").unwrap();
            // No finish(): drop signals completion.
        }
        let mut buf = [0u8; 32];
        let n = pipe.read_chunk(&mut buf);
        assert_eq!(&buf[..n], b"partial");
        assert_eq!(pipe.read_chunk(&mut buf), 0);
    }

    #[test]
    fn test_std_io_reader_adapter() {
        use std::io::Read;
        let pipe = Arc::new(BytePipe::new());
        let mut writer = pipe.writer();
        writer.write_all(b"adapter").unwrap();
        writer.finish();

        let mut reader = pipe.reader();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "adapter");
    }
}
