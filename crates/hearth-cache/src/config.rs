//! Cache configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default grace period before an unobserved live entry is torn down.
pub const DEFAULT_TEARDOWN: Duration = Duration::from_millis(100);

/// Default per-entry broadcast capacity.
///
/// A subscriber further behind than this ends with
/// [`CacheError::Lagged`](crate::CacheError::Lagged).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Which side of a server render the cache runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// Produces the hydration map; no memoization.
    Server,
    /// Consumes the hydration map and memoizes live listeners.
    #[default]
    Browser,
}

/// When a live entry with no subscribers is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TeardownRepr", into = "TeardownRepr")]
pub enum TeardownDelay {
    /// As soon as the detaching task yields.
    Immediate,
    After(Duration),
    /// Keep the listener open until invalidated.
    Never,
}

impl Default for TeardownDelay {
    fn default() -> Self {
        TeardownDelay::After(DEFAULT_TEARDOWN)
    }
}

impl fmt::Display for TeardownDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownDelay::Immediate => f.write_str("immediate"),
            TeardownDelay::After(d) => write!(f, "{}ms", d.as_millis()),
            TeardownDelay::Never => f.write_str("never"),
        }
    }
}

impl FromStr for TeardownDelay {
    type Err = String;

    /// Accepts `never`, `immediate`, or a number of milliseconds (`0` is
    /// the same as `immediate`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "never" => Ok(TeardownDelay::Never),
            "immediate" => Ok(TeardownDelay::Immediate),
            other => {
                let ms = other
                    .trim_end_matches("ms")
                    .parse::<u64>()
                    .map_err(|_| format!("invalid teardown delay: {other}"))?;
                Ok(TeardownDelay::from_millis(ms))
            }
        }
    }
}

impl TeardownDelay {
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            TeardownDelay::Immediate
        } else {
            TeardownDelay::After(Duration::from_millis(ms))
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TeardownRepr {
    Millis(u64),
    Named(String),
}

impl TryFrom<TeardownRepr> for TeardownDelay {
    type Error = String;

    fn try_from(repr: TeardownRepr) -> Result<Self, Self::Error> {
        match repr {
            TeardownRepr::Millis(ms) => Ok(TeardownDelay::from_millis(ms)),
            TeardownRepr::Named(name) => name.parse(),
        }
    }
}

impl From<TeardownDelay> for TeardownRepr {
    fn from(delay: TeardownDelay) -> Self {
        match delay {
            TeardownDelay::After(d) => TeardownRepr::Millis(d.as_millis() as u64),
            other => TeardownRepr::Named(other.to_string()),
        }
    }
}

/// Which query keys a committed write invalidates beyond the written
/// documents and their parent collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryInvalidation {
    #[default]
    None,
    /// Query keys over a written document's parent collection, including
    /// collection-group queries on its collection id.
    SameCollection,
    All,
}

/// Configuration for a [`LiveCache`](crate::LiveCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub context: ExecutionContext,
    /// Share listeners through the multiplexer. When off, every watch opens
    /// its own listener.
    pub memorize: bool,
    pub teardown: TeardownDelay,
    pub channel_capacity: usize,
    pub query_invalidation: QueryInvalidation,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            context: ExecutionContext::default(),
            memorize: true,
            teardown: TeardownDelay::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            query_invalidation: QueryInvalidation::default(),
        }
    }
}

impl CacheConfig {
    pub fn server() -> Self {
        Self {
            context: ExecutionContext::Server,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_memorize(mut self, memorize: bool) -> Self {
        self.memorize = memorize;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownDelay) -> Self {
        self.teardown = teardown;
        self
    }

    /// Set the per-entry broadcast capacity (at least 1).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_query_invalidation(mut self, policy: QueryInvalidation) -> Self {
        self.query_invalidation = policy;
        self
    }
}
