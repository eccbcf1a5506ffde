//! Log output with secret redaction.
//!
//! Secrets are registered on a [`Redactor`] that is handed to the log writer
//! when the subscriber is built and to the build steps that mint new secrets.
//! There is no process-wide filter list.

use std::io::{self, Write};
use std::sync::{Arc, PoisonError, RwLock};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Replacement text for redacted values.
pub const REDACTED: &str = "<sensitive>";

const DEFAULT_FILTER: &str = "info";

/// Shared list of values that must never reach the logs.
#[derive(Clone, Debug, Default)]
pub struct Redactor {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl Redactor {
    /// Creates an empty redactor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `secret`. Blank values are ignored.
    pub fn register(&self, secret: impl Into<String>) {
        let value = secret.into();
        if value.trim().is_empty() {
            return;
        }
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if secrets.contains(&value) {
            return;
        }
        secrets.push(value);
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
    }

    /// Returns `text` with every registered secret replaced.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        secrets
            .iter()
            .fold(text.to_owned(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }
}

/// [`MakeWriter`] that redacts everything written through it.
#[derive(Clone, Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Redactor,
}

impl<M> RedactingMakeWriter<M> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: M, redactor: Redactor) -> Self {
        Self { inner, redactor }
    }
}

/// Writer produced by [`RedactingMakeWriter`].
#[derive(Debug)]
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Redactor,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner
            .write_all(self.redactor.redact(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}

/// Installs the global subscriber writing redacted output to stderr.
///
/// `RUST_LOG` selects the filter; the default is `info`.
///
/// # Errors
///
/// Returns an error when a global subscriber is already installed.
pub fn init(redactor: Redactor) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingMakeWriter::new(io::stderr, redactor))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|err| panic!("capture lock: {err}"))
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(
                &self
                    .0
                    .lock()
                    .unwrap_or_else(|err| panic!("capture lock: {err}")),
            )
            .into_owned()
        }
    }

    #[test]
    fn redact_replaces_every_occurrence() {
        let redactor = Redactor::new();
        redactor.register("tok-123");
        redactor.register("  ");
        assert_eq!(
            redactor.redact("token tok-123 and again tok-123"),
            "token <sensitive> and again <sensitive>"
        );
    }

    #[test]
    fn longer_secrets_win_over_their_prefixes() {
        let redactor = Redactor::new();
        redactor.register("abc");
        redactor.register("abcdef");
        assert_eq!(redactor.redact("xabcdefx"), "x<sensitive>x");
    }

    #[test]
    fn subscriber_output_is_redacted() {
        let redactor = Redactor::new();
        redactor.register("do-secret-token");
        let captured = Captured::default();
        let sink = captured.clone();
        let make_writer = RedactingMakeWriter::new(move || sink.clone(), redactor);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(make_writer)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(token = "do-secret-token", "authenticating");
        });

        let text = captured.text();
        assert!(text.contains("<sensitive>"), "log: {text}");
        assert!(!text.contains("do-secret-token"), "log: {text}");
    }
}
