//! Single-producer / single-consumer fragment pipe
//!
//! [`pipe`] returns a reader and a writer. The writer is moved into the
//! producing task; the reader goes to whoever consumes the stream. Neither
//! half is `Clone`. The writer ends the stream with [`StreamWriter::close`]
//! (or by being dropped) or with a terminal error via [`StreamWriter::fail`].
//! Once the reader has observed the end or an error it keeps returning that
//! same terminal signal.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::types::{Message, Role};

enum Frame<T> {
    Item(T),
    Error(AgentError),
}

/// Terminal signal of a stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Failed(AgentError),
}

impl RecvError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Returned by [`StreamWriter::send`] once the reader has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream reader closed")]
pub struct ReaderClosed;

/// Create a connected reader/writer pair
pub fn pipe<T>() -> (StreamReader<T>, StreamWriter<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamReader {
            rx: Some(rx),
            terminal: None,
        },
        StreamWriter { tx },
    )
}

/// Producing half of a pipe
pub struct StreamWriter<T> {
    tx: mpsc::UnboundedSender<Frame<T>>,
}

impl<T> std::fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("reader_closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> StreamWriter<T> {
    /// Queue a fragment. Never blocks.
    pub fn send(&self, item: T) -> Result<(), ReaderClosed> {
        self.tx.send(Frame::Item(item)).map_err(|_| ReaderClosed)
    }

    /// End the stream with an error
    pub fn fail(self, err: AgentError) {
        let _ = self.tx.send(Frame::Error(err));
    }

    /// End the stream cleanly
    pub fn close(self) {}

    pub fn is_reader_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the reader has been closed or dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consuming half of a pipe
pub struct StreamReader<T> {
    rx: Option<mpsc::UnboundedReceiver<Frame<T>>>,
    terminal: Option<RecvError>,
}

impl<T> std::fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("open", &self.rx.is_some())
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl<T> StreamReader<T> {
    /// A stream holding exactly one fragment
    pub fn once(item: T) -> Self {
        let (reader, writer) = pipe();
        let _ = writer.send(item);
        reader
    }

    /// A stream that fails on the first `recv`
    pub fn failed(err: AgentError) -> Self {
        let (reader, writer) = pipe();
        writer.fail(err);
        reader
    }

    /// Next fragment, or the terminal signal
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        if let Some(terminal) = &self.terminal {
            return Err(terminal.clone());
        }
        let next = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        match next {
            Some(Frame::Item(item)) => Ok(item),
            Some(Frame::Error(err)) => Err(self.finish(RecvError::Failed(err))),
            None => Err(self.finish(RecvError::EndOfStream)),
        }
    }

    /// Stop reading and release the producer. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
        if self.terminal.is_none() {
            self.terminal = Some(RecvError::EndOfStream);
        }
    }

    /// Drain every remaining fragment
    pub async fn collect(mut self) -> Result<Vec<T>, AgentError> {
        let mut items = Vec::new();
        loop {
            match self.recv().await {
                Ok(item) => items.push(item),
                Err(RecvError::EndOfStream) => return Ok(items),
                Err(RecvError::Failed(err)) => return Err(err),
            }
        }
    }

    fn finish(&mut self, terminal: RecvError) -> RecvError {
        self.rx = None;
        self.terminal = Some(terminal.clone());
        terminal
    }
}

/// Join streamed message fragments into one assistant message
pub fn concat_messages(fragments: &[Message]) -> Message {
    let content: String = fragments.iter().map(|m| m.content.as_str()).collect();
    let role = fragments.first().map(|m| m.role).unwrap_or(Role::Assistant);
    Message::new(role, content)
}
