//! Per-submission options and the event stream name.

use std::time::Duration;

/// When the future returned by a submission resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Resolve once the frame has been written and flushed to the output
    /// stream, independent of the remote execution outcome.
    Sent,

    /// Resolve only when a matching response frame has been read back.
    Processed,
}

/// Opt-in memoization of call results.
///
/// Cached entries are keyed by the call's identity: its registered name plus
/// the encoded form of its arguments. Two submissions whose arguments encode
/// identically share one remote execution within the TTL; anything that
/// perturbs the encoding (timestamps, random fields) defeats the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Caching {
    /// No memoization. Also invalidates any cached entry for the same call
    /// identity, so uncached submissions always observe fresh results.
    #[default]
    Disabled,

    /// Reuse a previous result for up to `ttl` after its completion.
    Enabled { ttl: Duration },
}

/// Options recognized by `submit`, `submit_task` and `raise`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    acknowledge: Option<AckMode>,
    caching: Caching,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the acknowledgement mode. Defaults are per operation kind:
    /// calls acknowledge when processed, tasks and events when sent.
    pub fn acknowledge(mut self, mode: AckMode) -> Self {
        self.acknowledge = Some(mode);
        self
    }

    /// Enable result caching with the given TTL. Only meaningful for calls
    /// acknowledged when processed.
    pub fn cached_for(mut self, ttl: Duration) -> Self {
        self.caching = Caching::Enabled { ttl };
        self
    }

    pub(crate) fn ack_or(&self, default: AckMode) -> AckMode {
        self.acknowledge.unwrap_or(default)
    }

    pub(crate) fn caching(&self) -> Caching {
        self.caching
    }
}

/// Ordering key for events.
///
/// Operations sharing a stream name execute in strict submission order on
/// the receiving side; operations without one have no ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(String);

impl StreamName {
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = SubmitOptions::new();
        assert_eq!(opts.ack_or(AckMode::Processed), AckMode::Processed);
        assert_eq!(opts.ack_or(AckMode::Sent), AckMode::Sent);
        assert_eq!(opts.caching(), Caching::Disabled);
    }

    #[test]
    fn overrides() {
        let opts = SubmitOptions::new()
            .acknowledge(AckMode::Sent)
            .cached_for(Duration::from_millis(100));
        assert_eq!(opts.ack_or(AckMode::Processed), AckMode::Sent);
        assert_eq!(
            opts.caching(),
            Caching::Enabled {
                ttl: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn stream_name_display() {
        let name = StreamName::of("logs");
        assert_eq!(name.as_str(), "logs");
        assert_eq!(name.to_string(), "logs");
        assert!(StreamName::of("").is_empty());
    }
}
