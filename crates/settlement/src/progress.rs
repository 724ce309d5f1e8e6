//! Progress arithmetic for batch runs.

/// Percentage of `processed` over `total`, clamped to `0.0..=100.0`.
///
/// Display-only; counts stay integral. An empty run (`total == 0`) reports 0
/// until it is finished, and 100 is reported only once `processed` reaches
/// `total`.
pub fn progress_percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    if processed >= total {
        return 100.0;
    }
    let pct = (processed as f64 / total as f64) * 100.0;
    // Keep two decimals so successive reads compare cleanly.
    ((pct * 100.0).round() / 100.0).min(MAX_UNFINISHED)
}

const MAX_UNFINISHED: f64 = 99.99;
