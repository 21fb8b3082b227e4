//! Orchestrator configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a signal picks the step it resumes when no waiting step expects its
/// name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMatching {
    /// Resume the first waiting step in declaration order.
    #[default]
    FallbackToFirst,
    /// Only resume a step whose declared or parked signal name matches.
    Strict,
}

/// Which steps the saga compensates when a run fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationScope {
    /// Only the step that failed.
    #[default]
    FailedStep,
    /// The failed step, then every completed step in reverse topological
    /// order.
    Unwind,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), " '{}' (expected one of: {})"),
                        other,
                        [$($text),+].join(", "),
                    )),
                }
            }
        }
    };
}

text_enum!(SignalMatching {
    FallbackToFirst => "fallback_to_first",
    Strict => "strict",
});

text_enum!(CompensationScope {
    FailedStep => "failed_step",
    Unwind => "unwind",
});

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// How long a step claim stays exclusive before another dispatcher may
    /// take it over.
    pub lock_ttl: Duration,
    pub compensation_scope: CompensationScope,
    pub signal_matching: SignalMatching,
    /// Sleep between empty queue polls in the worker.
    pub poll_interval: Duration,
    /// Upper bound on executor passes per `advance` call.
    pub max_passes: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            compensation_scope: CompensationScope::default(),
            signal_matching: SignalMatching::default(),
            poll_interval: Duration::from_millis(500),
            max_passes: 10_000,
        }
    }
}
