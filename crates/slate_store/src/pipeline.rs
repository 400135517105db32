//! Bounded command pipeline over the destination socket.
//!
//! Commands accumulate in an outgoing buffer until the pipeline width is
//! reached (or a flush is forced), then the whole buffer is sent and exactly
//! one reply per buffered command is awaited. A rate limit spaces real sends
//! so a migration cannot starve foreground traffic on either node.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::error::{MigrateError, MigrateResult};
use crate::resp::{self, ReplyReader, RECV_TIMEOUT};

/// Sink for decoded destination commands. The live implementation is the
/// pipeline; tests and the replication feed can collect instead.
pub trait CommandEmitter {
    fn emit(&mut self, args: &[Vec<u8>]) -> MigrateResult<()>;
}

pub struct CommandPipeline {
    stream: TcpStream,
    reader: ReplyReader,
    out: BytesMut,
    pending: usize,
    max_pipeline_size: usize,
    /// Commands per second; zero disables the limit.
    max_speed: u64,
    last_send_us: u64,
    stop: Arc<AtomicBool>,
}

impl CommandPipeline {
    pub fn connect(
        addr: &str,
        max_speed: u64,
        max_pipeline_size: usize,
        stop: Arc<AtomicBool>,
    ) -> MigrateResult<Self> {
        let stream =
            TcpStream::connect(addr).map_err(|err| MigrateError::network("connect", err))?;
        stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|err| MigrateError::network("set receive timeout", err))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream,
            reader: ReplyReader::new(),
            out: BytesMut::new(),
            pending: 0,
            max_pipeline_size: max_pipeline_size.max(1),
            max_speed,
            last_send_us: 0,
            stop,
        })
    }

    /// Buffered commands not yet acknowledged by the destination.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Append a command without flushing.
    pub fn push(&mut self, args: &[Vec<u8>]) -> MigrateResult<()> {
        resp::encode_command(&mut self.out, args)?;
        self.pending += 1;
        Ok(())
    }

    /// Send the buffer and await one reply per buffered command.
    ///
    /// Without `force` this is a no-op until the pipeline width is reached;
    /// with an empty buffer it is always a no-op. Cancellation is checked at
    /// entry, before any I/O.
    pub fn flush(&mut self, force: bool) -> MigrateResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(MigrateError::Cancelled);
        }
        if !force && self.pending < self.max_pipeline_size {
            return Ok(());
        }
        if self.pending == 0 {
            return Ok(());
        }

        self.apply_speed_limit();

        let outgoing = self.out.split();
        std::io::Write::write_all(&mut self.stream, &outgoing)
            .map_err(|err| MigrateError::network("send commands", err))?;
        self.last_send_us = now_us();

        for _ in 0..self.pending {
            self.reader.read_reply(&mut self.stream)?;
        }
        self.pending = 0;
        Ok(())
    }

    /// Send one control command directly and require a non-error reply.
    ///
    /// Control commands (AUTH, import status) do not go through the command
    /// buffer and do not consult the cancellation flag: a cancelled or
    /// failed run must still be able to tell the destination to release
    /// partial state.
    pub fn send_control(&mut self, args: &[Vec<u8>]) -> MigrateResult<()> {
        let mut buf = BytesMut::new();
        resp::encode_command(&mut buf, args)?;
        std::io::Write::write_all(&mut self.stream, &buf)
            .map_err(|err| MigrateError::network("send control command", err))?;
        self.reader.read_reply(&mut self.stream)?;
        Ok(())
    }

    fn apply_speed_limit(&self) {
        if self.max_speed == 0 {
            return;
        }
        let spacing = min_flush_spacing_us(self.max_speed, self.max_pipeline_size);
        let now = now_us();
        if self.last_send_us + spacing > now {
            let wait = self.last_send_us + spacing - now;
            tracing::debug!(wait_us = wait, "sleeping to limit migration speed");
            std::thread::sleep(Duration::from_micros(wait));
        }
    }
}

impl CommandEmitter for CommandPipeline {
    /// Append and flush if the pipeline is full.
    fn emit(&mut self, args: &[Vec<u8>]) -> MigrateResult<()> {
        self.push(args)?;
        self.flush(false)
    }
}

/// Minimum spacing between real sends, never below one microsecond.
pub fn min_flush_spacing_us(max_speed: u64, max_pipeline_size: usize) -> u64 {
    (max_pipeline_size as u64 * 1_000_000 / max_speed).max(1)
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Destination stub that acknowledges `count` commands with `+OK`.
    fn ok_server(listener: TcpListener, count: usize) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            conn.set_read_timeout(Some(Duration::from_secs(5))).ok();
            let mut buf = BytesMut::new();
            let mut replied = 0usize;
            let mut chunk = [0u8; 4096];
            while replied < count {
                let read = conn.read(&mut chunk).expect("read");
                if read == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..read]);
                while let Ok(Some(_)) =
                    redis_protocol::resp2::decode::decode_bytes_mut(&mut buf)
                {
                    conn.write_all(b"+OK\r\n").expect("write reply");
                    replied += 1;
                }
            }
            replied
        })
    }

    #[test]
    fn flush_is_deferred_until_width_reached() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = ok_server(listener, 3);

        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = CommandPipeline::connect(&addr, 0, 3, stop).expect("connect");
        for i in 0..2 {
            pipeline
                .emit(&[b"SET".to_vec(), format!("k{i}").into_bytes(), b"v".to_vec()])
                .expect("emit");
        }
        // Width not reached; nothing acknowledged yet.
        assert_eq!(pipeline.pending(), 2);
        pipeline
            .emit(&[b"SET".to_vec(), b"k2".to_vec(), b"v".to_vec()])
            .expect("emit");
        assert_eq!(pipeline.pending(), 0, "third emit crossed the width");
        assert_eq!(server.join().expect("server thread"), 3);
    }

    #[test]
    fn cancellation_fails_flush_before_io() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = CommandPipeline::connect(&addr, 0, 4, stop.clone()).expect("connect");
        pipeline.push(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]).expect("push");
        stop.store(true, Ordering::Release);
        match pipeline.flush(true) {
            Err(MigrateError::Cancelled) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        drop(listener);
    }

    #[test]
    fn spacing_formula_matches_documented_bounds() {
        assert_eq!(min_flush_spacing_us(4096, 16), 3906);
        assert_eq!(min_flush_spacing_us(1, 16), 16_000_000);
        // Never below one microsecond even for absurd speeds.
        assert_eq!(min_flush_spacing_us(u64::MAX, 1), 1);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = CommandPipeline::connect(&addr, 0, 4, stop).expect("connect");
        pipeline.flush(true).expect("flush");
        assert_eq!(pipeline.pending(), 0);
        drop(listener);
    }
}
