//! Wire codec for the destination session.
//!
//! Commands go out as RESP2 bulk-string arrays; replies come back one at a
//! time. The reader keeps an expanding buffer and issues one more blocking
//! read whenever the buffer cannot complete the current reply. A receive
//! timeout turns a stalled destination into a failure instead of a hang.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use redis_protocol::resp2::decode::decode_bytes_mut;
use redis_protocol::resp2::encode::extend_encode;
use redis_protocol::resp2::types::BytesFrame;

use crate::error::{MigrateError, MigrateResult};

/// Receive timeout per blocking read. Not retried on expiry.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

/// Append one command in bulk-array form to `buf`.
pub fn encode_command(buf: &mut BytesMut, args: &[Vec<u8>]) -> MigrateResult<()> {
    let frame = BytesFrame::Array(
        args.iter()
            .map(|arg| BytesFrame::BulkString(Bytes::copy_from_slice(arg)))
            .collect(),
    );
    extend_encode(buf, &frame)
        .map_err(|err| MigrateError::ProtocolParse(format!("encode command: {err}")))?;
    Ok(())
}

/// Successful destination reply shapes. An error reply never becomes a
/// `Reply`; it fails the read with the server's message verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(Bytes),
    Integer(i64),
    Bulk(Bytes),
    Nil,
}

/// Incremental reply parser over a blocking socket.
#[derive(Default)]
pub struct ReplyReader {
    buf: BytesMut,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read exactly one reply, blocking for more bytes as needed.
    pub fn read_reply(&mut self, stream: &mut TcpStream) -> MigrateResult<Reply> {
        loop {
            match decode_bytes_mut(&mut self.buf) {
                Ok(Some((frame, _, _))) => return classify(frame),
                Ok(None) => {}
                Err(err) => {
                    return Err(MigrateError::ProtocolParse(format!("decode reply: {err}")))
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = stream.read(&mut chunk).map_err(|err| {
                let context = match err.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                        "reply receive timed out"
                    }
                    _ => "read reply",
                };
                MigrateError::network(context, err)
            })?;
            if read == 0 {
                return Err(MigrateError::network(
                    "read reply",
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "destination closed the connection",
                    ),
                ));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

fn classify(frame: BytesFrame) -> MigrateResult<Reply> {
    match frame {
        BytesFrame::SimpleString(data) => Ok(Reply::Simple(data)),
        BytesFrame::Integer(value) => Ok(Reply::Integer(value)),
        BytesFrame::BulkString(data) => Ok(Reply::Bulk(data)),
        BytesFrame::Null => Ok(Reply::Nil),
        BytesFrame::Error(message) => Err(MigrateError::Destination(message.to_string())),
        BytesFrame::Array(_) => Err(MigrateError::ProtocolParse(
            "unexpected array reply from destination".to_string(),
        )),
    }
}

/// Format a double with enough precision to round-trip.
pub fn format_double(value: f64) -> String {
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn encodes_bulk_array_wire_form() {
        let mut buf = BytesMut::new();
        encode_command(
            &mut buf,
            &[b"SET".to_vec(), b"k".to_vec(), b"v1".to_vec()],
        )
        .expect("encode");
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n");
    }

    #[test]
    fn parses_replies_across_split_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            conn.write_all(b"+OK\r\n:12\r\n$3\r\nab").expect("write");
            conn.flush().ok();
            std::thread::sleep(Duration::from_millis(50));
            conn.write_all(b"c\r\n$-1\r\n").expect("write");
        });

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(RECV_TIMEOUT)).expect("timeout");
        let mut reader = ReplyReader::new();
        assert_eq!(
            reader.read_reply(&mut stream).expect("reply"),
            Reply::Simple(Bytes::from_static(b"OK"))
        );
        assert_eq!(
            reader.read_reply(&mut stream).expect("reply"),
            Reply::Integer(12)
        );
        assert_eq!(
            reader.read_reply(&mut stream).expect("reply"),
            Reply::Bulk(Bytes::from_static(b"abc"))
        );
        assert_eq!(reader.read_reply(&mut stream).expect("reply"), Reply::Nil);
        server.join().expect("server thread");
    }

    #[test]
    fn error_reply_carries_server_message() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            conn.write_all(b"-ERR no such slot\r\n").expect("write");
        });

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(RECV_TIMEOUT)).expect("timeout");
        let mut reader = ReplyReader::new();
        match reader.read_reply(&mut stream) {
            Err(MigrateError::Destination(message)) => {
                assert!(message.contains("no such slot"), "message: {message}")
            }
            other => panic!("expected destination error, got {other:?}"),
        }
        server.join().expect("server thread");
    }

    #[test]
    fn stalled_destination_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");
        let mut reader = ReplyReader::new();
        match reader.read_reply(&mut stream) {
            Err(MigrateError::NetworkIo { context, .. }) => {
                assert_eq!(context, "reply receive timed out")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        drop(listener);
    }

    #[test]
    fn double_formatting_round_trips() {
        for value in [0.0, 1.0, -2.5, 0.1, 1e300, -1.23456789012345e-7] {
            let text = format_double(value);
            let back: f64 = text.parse().expect("parse double");
            assert_eq!(back.to_bits(), value.to_bits(), "value {value} via {text}");
        }
    }
}
