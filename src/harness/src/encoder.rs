//! Fixture to engine load-format encoding

use engine::duration::format_duration;

use crate::fixture::Fixture;

/// Render a fixture as a single `load` block the engine can ingest
pub fn encode(fixture: &Fixture) -> String {
    let mut out = format!("load {}\n", format_duration(fixture.interval()));
    for spec in fixture.series_specs() {
        out.push_str(&format!("  {} {}\n", spec.selector, spec.values));
    }
    out
}
