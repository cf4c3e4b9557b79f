//! Text chat over the `"chat"` data channel.
//!
//! Chat frames are plain UTF-8 text, one message per frame, no envelope.
//! Local messages are echoed into the log before the frame leaves, so a
//! delivery failure never loses the sender's view of what they wrote.

use crate::data_channel::Frame;
use crate::error::Error;
use crate::transfer::SendGuard;
use futures_util::{Sink, SinkExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub author: Author,
    /// Position in the session-local order, starting at zero.
    pub sequence: u64,
}

/// Append-only message history of one session.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn push_local(&mut self, text: String) -> ChatMessage {
        self.push(text, Author::Local)
    }

    pub fn push_remote(&mut self, text: String) -> ChatMessage {
        self.push(text, Author::Remote)
    }

    fn push(&mut self, text: String, author: Author) -> ChatMessage {
        let msg = ChatMessage {
            text,
            author,
            sequence: self.messages.len() as u64,
        };
        self.messages.push(msg.clone());
        msg
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Trims `text` and rejects messages that are empty after trimming.
pub fn prepare(text: &str) -> Result<&str, Error> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(Error::EmptyMessage)
    } else {
        Ok(trimmed)
    }
}

/// Sends one chat message, echoing it into `log` first.
///
/// Fails early when the text is blank or another send holds the guard.
/// A transport failure after the local echo is only logged; the returned
/// message is the echoed one either way.
pub async fn send_chat<S>(
    sink: &mut S,
    log: &mut ChatLog,
    guard: &SendGuard,
    text: &str,
) -> Result<ChatMessage, Error>
where
    S: Sink<Frame, Error = Error> + Unpin,
{
    let trimmed = prepare(text)?;
    let _permit = guard.acquire()?;

    let msg = log.push_local(trimmed.to_owned());
    if let Err(cause) = sink.send(Frame::Text(msg.text.clone())).await {
        log::warn!("chat message not delivered: {}", cause);
    }
    Ok(msg)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[derive(Debug, Default)]
    struct VecSink(Vec<Frame>);

    impl Sink<Frame> for VecSink {
        type Error = Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Error> {
            self.0.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink that fails every send.
    #[derive(Debug, Default)]
    struct FailSink;

    impl Sink<Frame> for FailSink {
        type Error = Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Err(Error::ChannelClosed))
        }

        fn start_send(self: Pin<&mut Self>, _: Frame) -> Result<(), Error> {
            Err(Error::ChannelClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Err(Error::ChannelClosed))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn sends_trimmed_text_and_echoes_locally() {
        let mut sink = VecSink::default();
        let mut log = ChatLog::default();
        let guard = SendGuard::default();

        let msg = send_chat(&mut sink, &mut log, &guard, "  hello there  ")
            .await
            .unwrap();
        assert_eq!(msg.text, "hello there");
        assert_eq!(msg.author, Author::Local);
        assert_eq!(msg.sequence, 0);
        assert_eq!(sink.0, vec![Frame::Text("hello there".to_owned())]);
        assert!(!guard.is_busy());
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_any_effect() {
        let mut sink = VecSink::default();
        let mut log = ChatLog::default();
        let guard = SendGuard::default();

        let err = send_chat(&mut sink, &mut log, &guard, "   \n  ").await.unwrap_err();
        assert!(matches!(err, Error::EmptyMessage));
        assert!(log.messages().is_empty());
        assert!(sink.0.is_empty());
    }

    #[tokio::test]
    async fn busy_guard_blocks_the_send() {
        let mut sink = VecSink::default();
        let mut log = ChatLog::default();
        let guard = SendGuard::default();
        let _held = guard.acquire().unwrap();

        let err = send_chat(&mut sink, &mut log, &guard, "hi").await.unwrap_err();
        assert!(matches!(err, Error::SendBusy));
        assert!(log.messages().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_still_echoes_locally() {
        let mut sink = FailSink;
        let mut log = ChatLog::default();
        let guard = SendGuard::default();

        let msg = send_chat(&mut sink, &mut log, &guard, "lost in transit")
            .await
            .unwrap();
        assert_eq!(msg.text, "lost in transit");
        assert_eq!(log.messages().len(), 1);
    }

    #[test]
    fn log_interleaves_authors_in_order() {
        let mut log = ChatLog::default();
        log.push_local("a".to_owned());
        log.push_remote("b".to_owned());
        let last = log.push_local("c".to_owned());
        assert_eq!(last.sequence, 2);
        let authors: Vec<Author> = log.messages().iter().map(|m| m.author).collect();
        assert_eq!(authors, vec![Author::Local, Author::Remote, Author::Local]);
    }
}
