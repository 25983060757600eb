//! The DATA phase. The body is read through a small state machine
//! that only recognizes `<CRLF>.<CRLF>` as the end of the message,
//! so that near-miss terminators such as `<LF>.<LF>` are treated as
//! message content rather than allowing a second message to be
//! smuggled past the checkers.
use crate::checker::Stage;
use crate::karma;
use crate::session::{Next, Session, SessionError};
use tokio::io::AsyncBufReadExt;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Immediately after DATA or after a CRLF
    LineStart,
    Text,
    /// Saw a CR in the middle of a line
    Cr,
    /// Saw a dot at the start of a line
    Dot,
    /// Saw `.` `\r` at the start of a line
    DotCr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// The unstuffed message, without the terminating `.<CRLF>`
    Complete(Vec<u8>),
    /// The message was read to its end but exceeded the size limit
    TooBig,
}

/// Incrementally decodes a dot-stuffed message body
#[derive(Debug)]
pub struct DotDecoder {
    state: State,
    body: Vec<u8>,
    limit: usize,
    overflow: bool,
    done: bool,
}

impl DotDecoder {
    /// Bytes beyond `limit` are discarded, but the input is still
    /// consumed up to the terminator.
    pub fn new(limit: usize) -> Self {
        Self {
            state: State::LineStart,
            body: vec![],
            limit,
            overflow: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of input. Returns the number of bytes that were
    /// consumed if the terminator was found within `chunk`; the
    /// remainder belongs to whatever follows the message.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        for (idx, &b) in chunk.iter().enumerate() {
            if self.step(b) {
                self.done = true;
                return Some(idx + 1);
            }
        }
        None
    }

    pub fn finish(self) -> DataOutcome {
        if self.overflow {
            DataOutcome::TooBig
        } else {
            DataOutcome::Complete(self.body)
        }
    }

    /// Returns true when `b` completes the terminator
    fn step(&mut self, b: u8) -> bool {
        match self.state {
            State::LineStart => {
                if b == b'.' {
                    self.state = State::Dot;
                } else {
                    self.text(b);
                }
            }
            State::Dot => {
                if b == b'\r' {
                    self.state = State::DotCr;
                } else {
                    // A stuffed dot; drop it and keep the byte
                    self.text(b);
                }
            }
            State::DotCr => {
                if b == b'\n' {
                    return true;
                }
                self.emit(b'\r');
                self.after_cr(b);
            }
            State::Text => self.text(b),
            State::Cr => self.after_cr(b),
        }
        false
    }

    fn text(&mut self, b: u8) {
        self.emit(b);
        self.state = if b == b'\r' { State::Cr } else { State::Text };
    }

    fn after_cr(&mut self, b: u8) {
        self.emit(b);
        self.state = match b {
            b'\n' => State::LineStart,
            b'\r' => State::Cr,
            _ => State::Text,
        };
    }

    fn emit(&mut self, b: u8) {
        if self.body.len() < self.limit {
            self.body.push(b);
        } else {
            self.overflow = true;
        }
    }
}

impl Session {
    pub(crate) async fn handle_data(&mut self) -> Result<Next, SessionError> {
        if self.tx.mail_from.is_none() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(502, "Missing MAIL FROM command.").await;
        }
        if self.tx.rcpt_to.is_empty() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(502, "Missing RCPT TO command.").await;
        }

        self.reply(354, "Go ahead. End your data with <CR><LF>.<CR><LF>")
            .await?;

        let data_timeout = self.server.config.data_timeout;
        let outcome = match timeout(data_timeout, self.read_body()).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(SessionError::DataTimedOut(data_timeout)),
        };

        let body = match outcome {
            DataOutcome::Complete(body) => body,
            DataOutcome::TooBig => {
                self.tx.penalize(karma::TOO_BIG_MESSAGE_PENALTY);
                self.tx.reset_envelope();
                let message = format!(
                    "Message exceeded max message size of {} bytes",
                    self.server.config.max_message_size
                );
                return self.reply_continue(552, message).await;
            }
        };

        tracing::debug!("received {} byte message", body.len());
        self.tx.set_body(body);

        let server = self.server.clone();
        for stage in [Stage::Data, Stage::Handler] {
            if let Err(err) = server.pipelines.run(stage, &mut self.tx).await {
                self.tx.reset_envelope();
                return self.reply_error_continue(&err).await;
            }
        }

        server.counters.messages_accepted.inc();
        self.tx.reward(karma::COMMAND_EXECUTED_PROPERLY);
        self.tx.reset_envelope();
        self.reply_continue(250, "Thank you.").await
    }

    /// Read up to and including the terminator. Anything the client
    /// pipelined after it is left in the buffer for the command loop.
    async fn read_body(&mut self) -> Result<DataOutcome, SessionError> {
        let mut decoder = DotDecoder::new(self.server.config.max_message_size);

        while !decoder.is_done() {
            let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
            let buf = stream.fill_buf().await?;
            if buf.is_empty() {
                return Err(SessionError::Disconnected);
            }
            let consumed = decoder.feed(buf).unwrap_or(buf.len());
            stream.consume(consumed);
            self.server.counters.bytes_read.inc_by(consumed as u64);
        }

        Ok(decoder.finish())
    }
}
