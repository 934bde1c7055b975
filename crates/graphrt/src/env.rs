use std::env;
use std::sync::OnceLock;

static GRAPHRT_PLAN_STATS: OnceLock<bool> = OnceLock::new();
static GRAPHRT_PLAN_CACHE_CAP: OnceLock<usize> = OnceLock::new();

const DEFAULT_PLAN_CACHE_CAPACITY: usize = 32;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

/// When set, every created plan is printed to stderr for inspection.
pub(crate) fn plan_stats_enabled() -> bool {
    *GRAPHRT_PLAN_STATS.get_or_init(|| match env::var("GRAPHRT_PLAN_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn plan_cache_capacity() -> usize {
    *GRAPHRT_PLAN_CACHE_CAP.get_or_init(|| {
        env::var("GRAPHRT_PLAN_CACHE_CAP")
            .ok()
            .and_then(|value| parse_usize(&value))
            .unwrap_or(DEFAULT_PLAN_CACHE_CAPACITY)
    })
}
