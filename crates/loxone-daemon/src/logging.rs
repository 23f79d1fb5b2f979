//! Structured logging setup, extended with secret redaction.
//!
//! Miniserver passwords and the cipher blobs/HMAC hashes derived from them
//! must never reach log output. Since `tracing`'s formatting happens before
//! our code sees the bytes, redaction is applied one layer further out: a
//! [`std::io::Write`] wrapper that scans each completed line for configured
//! secret values and overwrites them with `****` before the bytes leave the
//! process.

use std::io;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// A writer that replaces every occurrence of a configured secret substring
/// with `****` before forwarding to the wrapped writer.
#[derive(Clone)]
pub struct RedactingWriter {
    secrets: Arc<Vec<String>>,
}

impl RedactingWriter {
    /// Build a writer that scrubs the given secret values from every line.
    /// Empty strings are ignored (they would match everywhere).
    #[must_use]
    pub fn new(secrets: Vec<String>) -> Self {
        Self {
            secrets: Arc::new(secrets.into_iter().filter(|s| !s.is_empty()).collect()),
        }
    }

    fn redact(&self, line: &str) -> String {
        let mut redacted = line.to_string();
        for secret in self.secrets.iter() {
            if redacted.contains(secret.as_str()) {
                redacted = redacted.replace(secret.as_str(), "****");
            }
        }
        redacted
    }
}

impl io::Write for RedactingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = self.redact(&text);
        io::Write::write_all(&mut io::stdout(), redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut io::stdout())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingWriter {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Collect the secret values that must never appear in logs for a
/// configuration: every Miniserver password.
#[must_use]
pub fn secrets_from_config(config: &loxone_common::config::ExporterConfig) -> Vec<String> {
    config
        .miniservers
        .iter()
        .map(|ms| ms.password.clone())
        .collect()
}

/// Initialize the global tracing subscriber: JSON or compact text
/// formatting per `log_format`, an env-filter seeded from `log_level`
/// (overridable via `RUST_LOG`), and secret redaction for `secrets`.
pub fn init_logging(log_level: &str, log_format: &str, secrets: Vec<String>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("loxone_daemon={level},loxone_session={level},loxone_metrics={level},loxone_otlp={level},loxone_protocol={level},loxone_common={level}", level = log_level)));

    let writer = RedactingWriter::new(secrets);

    if log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(writer)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_configured_secret() {
        let writer = RedactingWriter::new(vec!["hunter2".to_string()]);
        let redacted = writer.redact("connecting with password=hunter2 to host");
        assert_eq!(redacted, "connecting with password=**** to host");
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let writer = RedactingWriter::new(vec![String::new(), "abc".to_string()]);
        assert_eq!(writer.secrets.len(), 1);
    }

    #[test]
    fn leaves_unrelated_text_untouched() {
        let writer = RedactingWriter::new(vec!["hunter2".to_string()]);
        let redacted = writer.redact("no secrets here");
        assert_eq!(redacted, "no secrets here");
    }
}
