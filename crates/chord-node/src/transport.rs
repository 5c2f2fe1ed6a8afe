//! Line-framed stream connections.
//!
//! Each connection runs as its own task that drains an outbound queue and
//! feeds complete inbound lines into the owner's event channel. The owner
//! never touches the socket directly; all of its state stays on one task.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Identifies one live stream connection owned by an event loop.
pub type ConnId = u64;

/// What a connection task reports back to its owner.
#[derive(Debug)]
pub enum ConnEvent {
    /// A complete line arrived, terminator stripped.
    Line { conn: ConnId, line: String },
    /// The peer disconnected, the connect failed, or a write failed. The
    /// task is gone; no reconnect is attempted.
    Closed { conn: ConnId },
}

/// Result of scanning the front of a read buffer for one framed record.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan<'a> {
    /// No terminator yet; more input is needed.
    Need,
    /// An empty line: a keepalive. Consumes exactly one byte.
    Keepalive,
    /// A complete record and the bytes consumed including the terminator.
    Line { line: &'a [u8], consumed: usize },
}

/// Scans one newline-terminated record off the front of `buf`.
pub fn scan(buf: &[u8]) -> Scan<'_> {
    match buf.iter().position(|b| *b == b'\n') {
        None => Scan::Need,
        Some(0) => Scan::Keepalive,
        Some(pos) => Scan::Line { line: &buf[..pos], consumed: pos + 1 },
    }
}

enum Cmd {
    Line(String),
    CloseWhenDone,
}

/// Write side of a connection, held by the owning event loop. Lines are
/// queued here and drained in order by the connection task.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<Cmd>,
}

impl ConnHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queues one line; the terminator is appended on the wire. An empty
    /// line comes out as a bare keepalive newline.
    pub fn write_line(&self, line: impl Into<String>) {
        let _ = self.tx.send(Cmd::Line(line.into()));
    }

    /// Lets everything queued so far flush, then closes the socket.
    pub fn close_when_done(&self) {
        let _ = self.tx.send(Cmd::CloseWhenDone);
    }
}

/// Takes ownership of an accepted stream.
pub fn spawn_accepted(
    conn: ConnId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> ConnHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_conn(conn, stream, rx, events));
    ConnHandle { id: conn, tx }
}

/// Starts an outbound connection. Lines can be queued on the returned
/// handle right away; they are written once the connect completes. A failed
/// connect surfaces as [`ConnEvent::Closed`].
pub fn spawn_outbound(
    conn: ConnId,
    addr: String,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> ConnHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        match TcpStream::connect(&addr).await {
            Ok(stream) => run_conn(conn, stream, rx, events).await,
            Err(e) => {
                tracing::debug!(conn, %addr, "Failed to connect: {e}");
                let _ = events.send(ConnEvent::Closed { conn });
            }
        }
    });
    ConnHandle { id: conn, tx }
}

async fn run_conn(
    conn: ConnId,
    stream: TcpStream,
    mut cmds: mpsc::UnboundedReceiver<Cmd>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut rbuf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(Cmd::Line(mut line)) => {
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                // Queued lines were delivered in order ahead of this, so
                // everything pending has already been written out.
                Some(Cmd::CloseWhenDone) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            read = reader.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    rbuf.extend_from_slice(&chunk[..n]);
                    drain_lines(conn, &mut rbuf, &events);
                }
            },
        }
    }

    let _ = events.send(ConnEvent::Closed { conn });
}

fn drain_lines(conn: ConnId, rbuf: &mut Vec<u8>, events: &mpsc::UnboundedSender<ConnEvent>) {
    loop {
        let (consumed, line) = match scan(rbuf) {
            Scan::Need => break,
            Scan::Keepalive => (1, None),
            Scan::Line { line, consumed } => (consumed, Some(line.to_vec())),
        };
        rbuf.drain(..consumed);
        if let Some(line) = line {
            match String::from_utf8(line) {
                Ok(line) => {
                    let _ = events.send(ConnEvent::Line { conn, line });
                }
                Err(_) => tracing::debug!(conn, "Dropping non-UTF-8 line"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_more_input_without_a_terminator() {
        assert_eq!(scan(b""), Scan::Need);
        assert_eq!(scan(b"CGET deadbeef"), Scan::Need);
    }

    #[test]
    fn keepalive_consumes_exactly_one_byte() {
        assert_eq!(scan(b"\nCSHOW\n"), Scan::Keepalive);
    }

    #[test]
    fn reports_bytes_consumed_including_terminator() {
        assert_eq!(
            scan(b"CSHOW\nCGET x\n"),
            Scan::Line { line: b"CSHOW", consumed: 6 }
        );
    }

    #[test]
    fn drains_every_complete_record() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rbuf = b"CSHOW\n\nCGET x\npartial".to_vec();
        drain_lines(7, &mut rbuf, &tx);

        let mut lines = Vec::new();
        while let Ok(ConnEvent::Line { conn, line }) = rx.try_recv() {
            assert_eq!(conn, 7);
            lines.push(line);
        }
        assert_eq!(lines, ["CSHOW", "CGET x"]);
        assert_eq!(rbuf, b"partial");
    }
}
