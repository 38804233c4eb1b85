//! Cross-source merge with primary-wins deduplication.

use tracing::debug;

use crate::readings::{IntervalReading, ReadingSource};

/// Concatenates both sources, sorts by start and keeps one reading per start.
///
/// When two readings share a start the primary one is kept. Two readings from
/// the same source at the same start keep the first one seen.
pub fn merge_readings(
    primary: Vec<IntervalReading>,
    secondary: Vec<IntervalReading>,
) -> Vec<IntervalReading> {
    let mut all = primary;
    all.extend(secondary);
    // Stable sort: among equal starts, primary ranks first, then arrival order.
    all.sort_by_key(|reading| (reading.start_ts_ms_utc, source_rank(reading.source)));

    let mut merged: Vec<IntervalReading> = Vec::with_capacity(all.len());
    let mut duplicates_removed = 0u64;
    for reading in all {
        if merged
            .last()
            .map(|existing| existing.start_ts_ms_utc == reading.start_ts_ms_utc)
            .unwrap_or(false)
        {
            duplicates_removed += 1;
        } else {
            merged.push(reading);
        }
    }

    if duplicates_removed > 0 {
        debug!(
            component = "merge",
            event = "merge.duplicates_removed",
            duplicates_removed,
            output_len = merged.len()
        );
    }

    merged
}

fn source_rank(source: ReadingSource) -> u8 {
    match source {
        ReadingSource::Primary => 0,
        ReadingSource::Secondary => 1,
    }
}
