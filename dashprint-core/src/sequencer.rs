//! Command sequencing: line-number framing, mutual exclusion, the resend
//! loop, and per-command timeouts. Connectivity/state checks belong to the
//! engine; the sequencer only knows how to get one command's reply out of
//! the wire correctly.

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;

use crate::codec::{frame, parse_reply, Reply, MAX_LINE_NO};
use crate::error::SendError;
use crate::link::{Closer, LinkEvent};

struct Inner {
    next_line_no: u32,
    events: broadcast::Receiver<LinkEvent>,
}

/// Serializes commands onto one link, one at a time, FIFO.
pub struct Sequencer {
    write_tx: tokio::sync::mpsc::Sender<Bytes>,
    closer: Closer,
    inner: Mutex<Inner>,
}

impl Sequencer {
    /// `events` must be a fresh subscription taken before any command is
    /// sent, so the sequencer never misses a reply line.
    pub fn new(
        write_tx: tokio::sync::mpsc::Sender<Bytes>,
        closer: Closer,
        events: broadcast::Receiver<LinkEvent>,
    ) -> Self {
        Self {
            write_tx,
            closer,
            inner: Mutex::new(Inner {
                next_line_no: 1,
                events,
            }),
        }
    }

    /// Sends `command`, waits for its reply, and returns every accumulated
    /// line up to and including the final `ok` line. Blocks until any
    /// earlier `send` call has completed.
    pub async fn send(&self, command: &str, timeout: Duration) -> Result<Vec<String>, SendError> {
        let mut inner = self.inner.lock().await;
        let cmd_token = command.split_whitespace().next().unwrap_or("");

        if cmd_token != "M110" && inner.next_line_no >= MAX_LINE_NO {
            self.write_and_await_one(&mut inner, "M110 N0\n".to_string(), timeout)
                .await?;
            inner.next_line_no = 1;
        }

        let (framed, line_no) = if cmd_token == "M110" {
            (format!("{}\n", command.trim_end()), None)
        } else {
            let line_no = inner.next_line_no;
            let framed = frame(line_no, command);
            inner.next_line_no += 1;
            (framed, Some(line_no))
        };

        self.transmit_with_resend(&mut inner, framed, line_no, timeout)
            .await
    }

    async fn write_and_await_one(
        &self,
        inner: &mut Inner,
        framed: String,
        timeout: Duration,
    ) -> Result<Vec<String>, SendError> {
        self.write(&framed).await?;
        match self.read_one(inner, timeout).await? {
            Reply::Ok => Ok(vec![]),
            Reply::Resend(_) => {
                self.closer.close();
                Err(SendError::UnrecoverableResend)
            }
        }
    }

    async fn transmit_with_resend(
        &self,
        inner: &mut Inner,
        framed: String,
        line_no: Option<u32>,
        timeout: Duration,
    ) -> Result<Vec<String>, SendError> {
        loop {
            self.write(&framed).await?;
            let mut accumulated = Vec::new();
            let mut retransmit = false;
            loop {
                let line = self.read_line(inner, timeout).await?;
                match parse_reply(line.as_bytes()) {
                    Some(Reply::Ok) => {
                        accumulated.push(line);
                        return Ok(accumulated);
                    }
                    Some(Reply::Resend(n)) => {
                        if Some(n) == line_no {
                            retransmit = true;
                            break;
                        }
                        self.closer.close();
                        return Err(SendError::UnrecoverableResend);
                    }
                    None => accumulated.push(line),
                }
            }
            debug_assert!(retransmit);
        }
    }

    async fn write(&self, framed: &str) -> Result<(), SendError> {
        self.write_tx
            .send(Bytes::copy_from_slice(framed.as_bytes()))
            .await
            .map_err(|_| SendError::WriteFailed("link task is gone".to_string()))
    }

    async fn read_line(&self, inner: &mut Inner, timeout: Duration) -> Result<String, SendError> {
        loop {
            match tokio::time::timeout(timeout, inner.events.recv()).await {
                Ok(Ok(LinkEvent::Line(bytes))) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Ok(LinkEvent::Restart)) => continue,
                Ok(Ok(LinkEvent::Closed)) => return Err(SendError::LinkLost),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(SendError::LinkLost),
                Err(_) => {
                    self.closer.close();
                    return Err(SendError::CommTimeout);
                }
            }
        }
    }

    async fn read_one(&self, inner: &mut Inner, timeout: Duration) -> Result<Reply, SendError> {
        loop {
            let line = self.read_line(inner, timeout).await?;
            if let Some(reply) = parse_reply(line.as_bytes()) {
                return Ok(reply);
            }
        }
    }
}
