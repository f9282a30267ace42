use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::lobby::Lobby;

pub const BUF_SIZE: usize = 8192;
pub const LINE_MAX: usize = 1024;
const READ_CHUNK: usize = 2048;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    LineTooLong,
    BufferOverflow,
}

impl FrameError {
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::LineTooLong => "line_too_long",
            FrameError::BufferOverflow => "buffer_overflow",
        }
    }
}

/// Accumulates raw socket bytes and splits out complete `\n`-terminated
/// lines. `\r` is stripped, empty lines are skipped. The line limit applies
/// to the content before the terminator.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer { buf: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, FrameError> {
        if self.buf.len() + data.len() > BUF_SIZE {
            return Err(FrameError::BufferOverflow);
        }
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        for i in 0..self.buf.len() {
            if self.buf[i] != b'\n' {
                continue;
            }
            let content = &self.buf[start..i];
            if content.len() >= LINE_MAX {
                return Err(FrameError::LineTooLong);
            }
            let text = String::from_utf8_lossy(content).replace('\r', "");
            if !text.is_empty() {
                lines.push(text);
            }
            start = i + 1;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        Ok(lines)
    }
}

/// Drives one client connection: allocates a slot, then multiplexes between
/// socket reads (framed into protocol lines) and the slot's outbound queue.
/// The queue closing means the coordinator dropped, freed, or handed the
/// slot to a resuming connection; either way this socket is done.
pub async fn handle_connection(stream: TcpStream, lobby: Arc<Mutex<Lobby>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connected = { lobby.lock().await.connect(tx, unix_now()) };
    let Some((ci, conn)) = connected else {
        debug!("no free client slot, closing connection");
        return;
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut frame = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            out = rx.recv() => {
                match out {
                    Some(line) => {
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            lobby.lock().await.disconnect(ci, conn, unix_now());
                            break;
                        }
                    }
                    None => break,
                }
            }
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        lobby.lock().await.disconnect(ci, conn, unix_now());
                        break;
                    }
                    Ok(n) => match frame.push(&chunk[..n]) {
                        Ok(lines) => {
                            let mut lobby = lobby.lock().await;
                            let now = unix_now();
                            for line in lines {
                                lobby.handle_line(ci, conn, &line, now);
                            }
                        }
                        Err(err) => {
                            lobby.lock().await.framing_error(ci, conn, err.reason(), unix_now());
                            break;
                        }
                    },
                    Err(_) => {
                        lobby.lock().await.disconnect(ci, conn, unix_now());
                        break;
                    }
                }
            }
        }
    }

    // Flush anything still queued (LOGOUT confirmations, farewell events).
    while let Ok(line) = rx.try_recv() {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}
