//! Router/scheduler/periodic-loop configuration knobs (spec.md §6)
//!
//! Grounded on the teacher's `message_router::config::RouterConfig`:
//! strongly-typed, `nutype`-validated fields, named constructors for common
//! deployments, and a crate that never reads files or env vars itself —
//! loading the shape below from TOML/JSON is an out-of-core bootstrap
//! concern (spec.md §1).

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain_types::{CallTimeoutMs, MaxHopCount};

/// Number of extra scheduler attempts after the first, per spec.md §4.5's
/// retry loop (`scheduler_retries + 1` total attempts).
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct SchedulerRetries(u32);

/// Seconds to sleep between scheduler retries on `NoCellsAvailable`.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into)
)]
pub struct SchedulerRetryDelaySecs(u64);

/// Seconds between instance-heal ticks; `0` disables the loop.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct InstanceUpdateIntervalSecs(i64);

/// How far back (in seconds) the heal loop looks for recently updated
/// instances when (re)building its iterator.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into)
)]
pub struct InstanceUpdatedAtThresholdSecs(u64);

/// How many uuids the heal loop pulls from its iterator per tick.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into)
)]
pub struct InstanceUpdateNumInstances(u32);

/// Topic prefix under which request/response queues are named
/// (`cells.rpc_driver_queue_base` in spec.md §6).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, AsRef)
)]
pub struct TopicBase(String);

/// All router/scheduler/periodic-loop configuration, gathered into one
/// value built once at startup and shared behind an `Arc` — the
/// "single initialized-once configuration value" called for by the
/// REDESIGN note in spec.md §9 (no process-wide mutable statics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Topic prefix for the message bus (`cells.rpc_driver_queue_base`).
    pub topic_base: TopicBase,
    /// Overall timeout for a response-expecting call.
    pub call_timeout: CallTimeoutMs,
    /// Maximum hops before a targeted message is bounced.
    pub max_hop_count: MaxHopCount,
    /// Extra scheduler attempts after the first.
    pub scheduler_retries: SchedulerRetries,
    /// Sleep between scheduler retries.
    pub scheduler_retry_delay: SchedulerRetryDelaySecs,
    /// Heal-loop tick interval; `0` disables the loop.
    pub instance_update_interval: InstanceUpdateIntervalSecs,
    /// Heal-loop lookback window.
    pub instance_updated_at_threshold: InstanceUpdatedAtThresholdSecs,
    /// Heal-loop per-tick batch size.
    pub instance_update_num_instances: InstanceUpdateNumInstances,
}

impl RouterConfig {
    /// A configuration suitable for local development and the scenario
    /// tests in spec.md §8: generous hop budget, short timeouts, a fast
    /// heal loop.
    #[must_use]
    pub fn development() -> Self {
        Self {
            topic_base: TopicBase::try_new("cells.intercell").unwrap(),
            call_timeout: CallTimeoutMs::try_new(5_000).unwrap(),
            max_hop_count: MaxHopCount::try_new(99).unwrap(),
            scheduler_retries: SchedulerRetries::new(3),
            scheduler_retry_delay: SchedulerRetryDelaySecs::try_new(1).unwrap(),
            instance_update_interval: InstanceUpdateIntervalSecs::new(60),
            instance_updated_at_threshold: InstanceUpdatedAtThresholdSecs::try_new(3_600).unwrap(),
            instance_update_num_instances: InstanceUpdateNumInstances::try_new(100).unwrap(),
        }
    }

    /// Whether the heal loop should run at all: disabled when the
    /// configured interval is non-positive, per spec.md §4.6.
    #[must_use]
    pub fn heal_loop_enabled(&self) -> bool {
        self.instance_update_interval.into_inner() > 0
    }

    /// The heal-loop tick interval as a [`Duration`], or `None` when the
    /// loop is disabled.
    #[must_use]
    pub fn heal_loop_interval(&self) -> Option<Duration> {
        let secs = self.instance_update_interval.into_inner();
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    /// The scheduler retry-sleep duration, with the `max(1, …)` floor spec.md
    /// §4.5 calls for already enforced by [`SchedulerRetryDelaySecs`]'s
    /// validation.
    #[must_use]
    pub fn scheduler_retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.scheduler_retry_delay.into_inner())
    }

    /// Total scheduler attempts: one plus the configured retry count.
    #[must_use]
    pub fn scheduler_max_attempts(&self) -> u32 {
        self.scheduler_retries.into_inner().saturating_add(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_config_validates() {
        let config = RouterConfig::development();
        assert!(config.heal_loop_enabled());
        assert_eq!(config.scheduler_max_attempts(), 4);
    }

    #[test]
    fn zero_retries_still_yields_one_attempt() {
        let mut config = RouterConfig::development();
        config.scheduler_retries = SchedulerRetries::new(0);
        assert_eq!(config.scheduler_max_attempts(), 1);
    }

    #[test]
    fn non_positive_interval_disables_heal_loop() {
        let mut config = RouterConfig::development();
        config.instance_update_interval = InstanceUpdateIntervalSecs::new(-1);
        assert!(!config.heal_loop_enabled());
        assert!(config.heal_loop_interval().is_none());
    }
}
