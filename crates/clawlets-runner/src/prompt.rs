//! Interactive secret sources.
//!
//! When nothing is submitted to the loopback endpoint in time, the buffer can
//! fall back to asking a [`SecretPrompt`]. The stock source reads one line of
//! JSON from stdin; tests and embedders plug in their own.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::PromptError;
use crate::store::SecretMap;

/// A source of secrets for one job, consulted as a last resort.
#[async_trait]
pub trait SecretPrompt: Send + Sync {
    /// Obtain the secrets for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError`] if the source cannot produce a secret map.
    async fn prompt(&self, job_id: &str) -> Result<SecretMap, PromptError>;
}

/// Reads one JSON object per prompt from a line-oriented reader.
pub struct LinePrompt<R> {
    reader: Mutex<R>,
}

/// [`LinePrompt`] over the process's stdin.
pub type StdinPrompt = LinePrompt<BufReader<Stdin>>;

impl<R> LinePrompt<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }
}

impl StdinPrompt {
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> std::fmt::Debug for LinePrompt<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinePrompt").finish_non_exhaustive()
    }
}

#[async_trait]
impl<R> SecretPrompt for LinePrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn prompt(&self, job_id: &str) -> Result<SecretMap, PromptError> {
        info!(job_id, "waiting for secrets as one line of JSON on stdin");

        let mut reader = self.reader.lock().await;
        let mut line = zeroize::Zeroizing::new(String::new());
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| PromptError::Io {
                reason: e.to_string(),
            })?;
        if read == 0 {
            return Err(PromptError::Closed);
        }

        parse_secret_line(&line)
    }
}

/// Parse one line of input into a [`SecretMap`].
///
/// The line must be a JSON object; non-string values and empty keys are
/// dropped.
///
/// # Errors
///
/// Returns [`PromptError::InvalidInput`] if the line is not a JSON object.
pub fn parse_secret_line(line: &str) -> Result<SecretMap, PromptError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).map_err(|e| PromptError::InvalidInput {
            reason: format!("not JSON: {e}"),
        })?;

    value
        .as_object()
        .map(SecretMap::from_json_object)
        .ok_or_else(|| PromptError::InvalidInput {
            reason: "expected a JSON object of secret names to values".to_owned(),
        })
}
