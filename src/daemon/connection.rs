//! Buffered, non-blocking line framing over one stream
//!
//! A [`Connection`] accumulates bytes until a newline, decodes each complete
//! line, and keeps a FIFO of outbound [`Message`]s that it drains without
//! blocking. A partially written message stays at the head of the queue and
//! resumes from the first unsent byte on the next flush.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use tracing::{debug, warn};

use crate::daemon::protocol::{decode_bytes, Event, Message};

/// Bytes requested per `read(2)`
pub const READ_CHUNK_SIZE: usize = 1024;

/// One decoded line and the bytes it was decoded from (newline stripped)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Event,
    pub line: Vec<u8>,
}

/// A peer on the other end of a socket (or a file being replayed)
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    input: Vec<u8>,
    unsent: VecDeque<Message>,
    /// Bytes of the head message already written
    sent: usize,
    dead: bool,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            input: Vec::new(),
            unsent: VecDeque::new(),
            sent: 0,
            dead: false,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Queue `message` behind everything already queued.
    ///
    /// The connection keeps its own handle on the message.
    pub fn enqueue(&mut self, message: &Message) {
        self.unsent.push_back(message.clone());
    }

    pub fn has_pending(&self) -> bool {
        !self.unsent.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.unsent.len()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Drop every queued message, returning how many were released
    pub fn release_queue(&mut self) -> usize {
        let released = self.unsent.len();
        self.unsent.clear();
        self.sent = 0;
        released
    }

    /// Bytes of an unterminated line received so far
    pub fn partial_input(&self) -> &[u8] {
        &self.input
    }

    fn accumulate(&mut self, mut data: &[u8], frames: &mut Vec<Frame>) {
        while let Some(pos) = data.iter().position(|&b| b == b'\n') {
            self.input.extend_from_slice(&data[..pos]);
            // Taken before decoding so that nothing downstream ever sees a
            // half-consumed accumulator.
            let line = std::mem::take(&mut self.input);
            match decode_bytes(&line) {
                Ok(Some(event)) => frames.push(Frame { event, line }),
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
            data = &data[pos + 1..];
        }
        self.input.extend_from_slice(data);
    }
}

impl<S: Read> Connection<S> {
    /// Read everything currently available and return the decoded lines.
    ///
    /// Stops on would-block. End of stream or a hard error marks the
    /// connection dead; an unterminated trailing line is logged and dropped.
    pub fn read_available(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("peer reached end of stream");
                    self.dead = true;
                    if !self.input.is_empty() {
                        warn!(
                            "Universal variable connection closed while reading command. Partial command received: '{}'",
                            String::from_utf8_lossy(&self.input)
                        );
                        self.input.clear();
                    }
                    break;
                }
                Ok(n) => self.accumulate(&chunk[..n], &mut frames),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error, closing connection: {}", e);
                    self.dead = true;
                    break;
                }
            }
        }

        frames
    }
}

impl<S: Write> Connection<S> {
    /// Write queued messages in order until the queue is empty, the stream
    /// would block, or the peer is found dead.
    pub fn flush_nonblocking(&mut self) {
        while let Some(head) = self.unsent.front() {
            let body = head.body();
            let total = body.len();
            let result = self.stream.write(&body[self.sent..]);

            match result {
                Ok(0) => {
                    debug!("peer accepted no bytes, closing connection");
                    self.dead = true;
                    return;
                }
                Ok(n) => {
                    self.sent += n;
                    if self.sent >= total {
                        self.unsent.pop_front();
                        self.sent = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("socket full, sending the rest later");
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("error while sending universal variable message, closing connection: {}", e);
                    self.dead = true;
                    return;
                }
            }
        }
    }
}
