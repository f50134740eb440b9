//! Line-oriented [`Transport`] over any async byte stream.
//!
//! Shared by the TCP socket and serial transports. Writes append the configured
//! terminator; reads return one line with `\r`/`\n` stripped. Every operation is
//! bounded by the handle timeout.

use crate::error::TransportError;
use crate::hardware::transport::{bounded, Transport};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Buffered line channel over `S`.
pub struct StreamTransport<S> {
    stream: Option<BufReader<S>>,
    timeout: Duration,
    terminator: String,
    label: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open stream.
    ///
    /// # Arguments
    /// * `stream` - Connected byte stream
    /// * `label` - Resource description used in logs
    /// * `timeout` - Initial per-call I/O timeout
    pub fn new(stream: S, label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            timeout,
            terminator: "\n".to_string(),
            label: label.into(),
        }
    }

    /// Set the line terminator appended to writes.
    ///
    /// Default: "\n"
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    fn stream(&mut self) -> Result<&mut BufReader<S>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let line = format!("{text}{}", self.terminator);
        tracing::trace!(resource = %self.label, command = text, "write");

        let stream = self.stream()?;
        bounded(timeout, async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await?;
            Ok(())
        })
        .await
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream()?;

        let mut response = String::new();
        let read = bounded(timeout, async {
            stream
                .read_line(&mut response)
                .await
                .map_err(TransportError::from)
        })
        .await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }

        let line = response.trim_end_matches(['\r', '\n']).to_string();
        tracing::trace!(resource = %self.label, response = %line, "read");
        Ok(line)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(resource = %self.label, "closing transport");
            stream.get_mut().shutdown().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} ({}ms timeout)", self.label, self.timeout.as_millis())
    }
}
