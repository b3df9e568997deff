//! Streaming sinks for token-by-token generation
//!
//! The generator calls [`TokenSink::on_token`] once per generated token, in
//! order, and waits for it to return before sampling the next one. A sink
//! error aborts generation; the sink decides nothing else.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use super::generator::FinishReason;

/// Receiver of generated text fragments.
pub trait TokenSink {
    /// Called for each generated token
    fn on_token(&mut self, fragment: &str) -> Result<()>;

    /// Called when generation ends normally
    fn on_complete(&mut self, _reason: &FinishReason) {}
}

impl<F> TokenSink for F
where
    F: FnMut(&str) -> Result<()>,
{
    fn on_token(&mut self, fragment: &str) -> Result<()> {
        self(fragment)
    }
}

/// Simple sink collecting generated text
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub text: String,
    pub fragments: Vec<String>,
    pub finish_reason: Option<FinishReason>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenSink for CollectingSink {
    fn on_token(&mut self, fragment: &str) -> Result<()> {
        self.text.push_str(fragment);
        self.fragments.push(fragment.to_string());
        Ok(())
    }

    fn on_complete(&mut self, reason: &FinishReason) {
        self.finish_reason = Some(reason.clone());
    }
}

/// Events forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(String),
    Finished(FinishReason),
}

/// Sink that forwards fragments into a bounded tokio channel.
///
/// Uses `blocking_send`, so it must be driven from a blocking thread (for
/// example inside `tokio::task::spawn_blocking`). A full channel blocks the
/// generator until the consumer catches up.
pub struct ChannelSink {
    sender: mpsc::Sender<StreamEvent>,
    tokens_sent: usize,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            sender,
            tokens_sent: 0,
        }
    }

    /// Create a sink together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn tokens_sent(&self) -> usize {
        self.tokens_sent
    }
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, fragment: &str) -> Result<()> {
        self.sender
            .blocking_send(StreamEvent::Fragment(fragment.to_string()))
            .map_err(|_| anyhow!("Stream closed by receiver"))?;
        self.tokens_sent += 1;
        Ok(())
    }

    fn on_complete(&mut self, reason: &FinishReason) {
        let _ = self.sender.blocking_send(StreamEvent::Finished(reason.clone()));
    }
}
