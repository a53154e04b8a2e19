//! The link task: one task multiplexes writes to the serial port with reads
//! from it, exactly as the teacher's own `printer_com_task` does, and
//! publishes every complete line (or restart banner, or closure) to a
//! broadcast channel so the sequencer's reply matcher and the supervisor's
//! idle watcher can both observe the wire without either starving the other.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use crate::codec::is_restart_banner;

/// A cloneable handle that can force the link task to stop. Closing twice, or
/// from two clones concurrently, is a no-op the second time.
#[derive(Clone)]
pub struct Closer(Arc<Mutex<Option<oneshot::Sender<()>>>>);

impl Closer {
    pub fn close(&self) {
        if let Ok(mut slot) = self.0.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: oneshot::Sender<()>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }
}

/// One thing that happened on the wire, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A complete line, not including the terminating `\n`.
    Line(Bytes),
    /// The firmware printed a `start` banner: it just (re)booted.
    Restart,
    /// The link task ended, whether from an I/O error or a requested close.
    Closed,
}

/// A running link task and the handles used to talk to it.
pub struct Link {
    write_tx: mpsc::Sender<Bytes>,
    events_tx: broadcast::Sender<LinkEvent>,
    closer: Closer,
    join: JoinHandle<()>,
}

impl Link {
    /// Spawns the link task over `transport`. Returns once the task is
    /// running; it keeps running until a read/write error, or until the
    /// [`Closer`] returned by [`Link::closer`] is used.
    ///
    /// Generic over the transport so a real [`crate::adapter::Port`] and an
    /// in-memory `tokio::io::duplex` half (used by tests to script firmware
    /// behavior) are driven by the identical task.
    pub fn spawn<IO>(transport: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(8);
        let (events_tx, _) = broadcast::channel(32);
        let (close_tx, close_rx) = oneshot::channel();
        let join = tokio::spawn(link_task(transport, write_rx, events_tx.clone(), close_rx));
        Self {
            write_tx,
            events_tx,
            closer: Closer(Arc::new(Mutex::new(Some(close_tx)))),
            join,
        }
    }

    /// A sender for raw, already-framed bytes to write to the port.
    pub fn writer(&self) -> mpsc::Sender<Bytes> {
        self.write_tx.clone()
    }

    /// Subscribes to the event stream. Each subscriber gets every event from
    /// the point of subscription onward.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    /// A cloneable handle that forces the link task to stop, dropping the
    /// port and unblocking any in-progress read. Shared between the
    /// supervisor (on `Stop()`) and the sequencer (on a fatal send error).
    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    /// Waits for the link task to end, whether from an error or a close
    /// request. Does not consume `self`, so it can be used in a `select!`
    /// alongside event subscriptions that outlive the wait.
    pub async fn closed(&mut self) {
        let _ = (&mut self.join).await;
    }
}

async fn link_task<IO>(
    mut port: IO,
    mut write_rx: mpsc::Receiver<Bytes>,
    events_tx: broadcast::Sender<LinkEvent>,
    mut close_rx: oneshot::Receiver<()>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(256);
    let mut read_buf = [0u8; 256];
    loop {
        tokio::select! {
            biased;
            _ = &mut close_rx => break,
            maybe_bytes = write_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        if let Err(e) = port.write_all(&bytes).await {
                            tracing::debug!("write failed: {e}");
                            break;
                        }
                        if let Err(e) = port.flush().await {
                            tracing::debug!("flush failed: {e}");
                            break;
                        }
                    }
                    None => {
                        // every writer handle was dropped; nothing left to do.
                    }
                }
            }
            read_result = port.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        tracing::debug!("serial port read returned EOF");
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&read_buf[..n]);
                        emit_complete_lines(&mut buf, &events_tx);
                    }
                    Err(e) => {
                        tracing::debug!("read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    let _ = events_tx.send(LinkEvent::Closed);
}

fn emit_complete_lines(buf: &mut BytesMut, events_tx: &broadcast::Sender<LinkEvent>) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line = buf.split_to(pos + 1);
        line.truncate(line.len() - 1); // drop the '\n'
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let line = line.freeze();
        if is_restart_banner(&String::from_utf8_lossy(&line)) {
            let _ = events_tx.send(LinkEvent::Restart);
        } else {
            let _ = events_tx.send(LinkEvent::Line(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_lines_from_one_chunk() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut buf = BytesMut::from(&b"ok\nstart\nT:200 /200\n"[..]);
        emit_complete_lines(&mut buf, &tx);
        assert!(buf.is_empty());
        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], LinkEvent::Line(ref l) if &l[..] == b"ok"));
        assert!(matches!(seen[1], LinkEvent::Restart));
        assert!(matches!(seen[2], LinkEvent::Line(ref l) if &l[..] == b"T:200 /200"));
    }

    #[test]
    fn holds_partial_line_until_newline_arrives() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut buf = BytesMut::from(&b"ok\npartial"[..]);
        emit_complete_lines(&mut buf, &tx);
        assert_eq!(&buf[..], b"partial");
        assert!(matches!(rx.try_recv().unwrap(), LinkEvent::Line(_)));
        assert!(rx.try_recv().is_err());
    }
}
