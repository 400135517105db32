//! Shared helpers for integration tests: a fake migration destination that
//! records every command it is sent and answers per the published protocol.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use redis_protocol::resp2::decode::decode_bytes_mut;
use redis_protocol::resp2::types::BytesFrame;

/// How a spawned destination behaves.
#[derive(Default, Clone)]
pub struct DestinationOptions {
    /// Password the destination accepts. `None` rejects every AUTH.
    pub password: Option<String>,
    /// Stop acknowledging data commands (control commands still answered).
    pub stall_data: bool,
}

/// In-process destination node. Accepts one session at a time, records each
/// parsed command, and replies `+OK` to control/SET-like commands and `:1`
/// to everything else.
pub struct FakeDestination {
    pub addr: String,
    commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDestination {
    pub fn spawn(options: DestinationOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake destination");
        let addr = listener.local_addr().expect("local addr").to_string();
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");

        let commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_commands = commands.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("fake-destination".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            serve_session(stream, &options, &thread_commands, &thread_shutdown)
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => return,
                    }
                }
            })
            .expect("spawn fake destination");

        Self {
            addr,
            commands,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Snapshot of every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<Vec<Vec<u8>>> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Commands rendered as space-joined strings for assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|args| {
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

impl Drop for FakeDestination {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_session(
    mut stream: TcpStream,
    options: &DestinationOptions,
    commands: &Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    shutdown: &Arc<AtomicBool>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .ok();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];

    while !shutdown.load(Ordering::Acquire) {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => buf.extend_from_slice(&chunk[..read]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }

        while let Ok(Some((frame, _, _))) = decode_bytes_mut(&mut buf) {
            let Some(args) = frame_args(frame) else {
                continue;
            };
            commands
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(args.clone());

            let verb = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
            let reply: Vec<u8> = match verb.as_str() {
                "AUTH" => match (&options.password, args.get(1)) {
                    (Some(expected), Some(given)) if expected.as_bytes() == given.as_slice() => {
                        b"+OK\r\n".to_vec()
                    }
                    _ => b"-ERR invalid password\r\n".to_vec(),
                },
                "CLUSTER" => b"+OK\r\n".to_vec(),
                _ if options.stall_data => continue,
                "SET" | "HMSET" | "XSETID" => b"+OK\r\n".to_vec(),
                _ => b":1\r\n".to_vec(),
            };
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    }
}

fn frame_args(frame: BytesFrame) -> Option<Vec<Vec<u8>>> {
    let BytesFrame::Array(parts) = frame else {
        return None;
    };
    if parts.is_empty() {
        return None;
    }
    let mut args = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            BytesFrame::BulkString(data) | BytesFrame::SimpleString(data) => {
                args.push(data.to_vec())
            }
            _ => return None,
        }
    }
    Some(args)
}

/// Install a log subscriber once when `RUST_LOG` is set.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    });
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
