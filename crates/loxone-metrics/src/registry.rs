//! Process-wide counters that outlive any single scrape.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts scrape failures across the process lifetime, independent of any
/// per-scrape `Registry`, since a failed scrape never got to render
/// itself into the text it would have produced.
#[derive(Debug, Default)]
pub struct ScrapeErrorCounter {
    count: AtomicU64,
}

impl ScrapeErrorCounter {
    /// Create a counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one scrape failure.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current failure count.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Render as a standalone Prometheus text line, appended to the main
    /// scrape body by the HTTP handler.
    #[must_use]
    pub fn render_line(&self) -> String {
        format!(
            "# HELP loxone_exporter_scrape_errors_total Scrape failures since process start\n\
             # TYPE loxone_exporter_scrape_errors_total counter\n\
             loxone_exporter_scrape_errors_total {}\n",
            self.get()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_increments() {
        let counter = ScrapeErrorCounter::new();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
        assert!(counter.render_line().contains("loxone_exporter_scrape_errors_total 2"));
    }
}
