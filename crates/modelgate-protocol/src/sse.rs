use bytes::Bytes;
use futures_util::{Stream, StreamExt};

/// Terminal frame of an OpenAI-style completion stream.
pub const DONE_FRAME: &str = "data: [DONE]";

pub fn is_done_frame(line: &str) -> bool {
    line.trim() == DONE_FRAME
}

/// Incremental line framing over a fallible byte stream.
///
/// Yields one line at a time without its terminator (a trailing `\r` is
/// stripped too). A trailing partial line is flushed once the stream ends.
/// Non-UTF-8 chunks are decoded lossily; SSE payloads are text.
pub struct LineStream<S> {
    inner: S,
    buffer: String,
    done: bool,
}

impl<S, E> LineStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            done: false,
        }
    }

    pub async fn next_line(&mut self) -> Result<Option<String>, E> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let mut line: String = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if self.done {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buffer)));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(err)) => return Err(err),
                None => self.done = true,
            }
        }
    }
}
