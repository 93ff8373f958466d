//! # Edge Detection
//!
//! Turns a sampled binary input into discrete part-produced events.
//!
//! ## Sampling Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Rising-edge detector (default)                      │
//! │                                                                         │
//! │  sample:   #1    #2    #3    #4    #5    #6    #7                      │
//! │  level:    HIGH  HIGH  LOW   HIGH  ERR   HIGH  LOW                     │
//! │  event:    -     -     -     ✓     -     -     -                       │
//! │            │                       │                                    │
//! │            │                       └─ read failure: skipped, previous   │
//! │            │                          level (HIGH) kept                 │
//! │            └─ first sample only seeds the previous level; the initial   │
//! │               state is unknown, never assumed LOW                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SensorError;

/// A binary input sampled on demand.
///
/// The engine never configures wiring; it only reads levels and releases
/// the input when shutting down.
pub trait SensorSource: Send {
    /// Reads the current level (true = active/high).
    fn read(&mut self) -> Result<bool, SensorError>;

    /// Releases the underlying input resource.
    fn release(&mut self) {}
}

/// Which transition counts as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Low → high (metal arrives at an active-high sensor).
    #[default]
    Rising,
    /// High → low (active-low sensors).
    Falling,
}

impl Edge {
    fn matches(self, previous: bool, current: bool) -> bool {
        match self {
            Edge::Rising => !previous && current,
            Edge::Falling => previous && !current,
        }
    }
}

/// A detected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub edge: Edge,
}

/// Edge detector over a [`SensorSource`].
pub struct EdgeDetector<S> {
    source: S,
    edge: Edge,
    previous: Option<bool>,
}

impl<S: SensorSource> EdgeDetector<S> {
    /// Creates a rising-edge detector.
    pub fn new(source: S) -> Self {
        Self::with_edge(source, Edge::Rising)
    }

    pub fn with_edge(source: S, edge: Edge) -> Self {
        EdgeDetector {
            source,
            edge,
            previous: None,
        }
    }

    /// Takes one sample, reporting read failures.
    ///
    /// A failed read leaves the previous level untouched, so the next good
    /// sample is compared against the last good one.
    pub fn sample(&mut self) -> Result<Option<Event>, SensorError> {
        let current = self.source.read()?;
        let event = match self.previous {
            Some(previous) if self.edge.matches(previous, current) => Some(Event { edge: self.edge }),
            _ => None,
        };
        self.previous = Some(current);
        Ok(event)
    }

    /// Takes one sample; read failures yield no event.
    pub fn poll(&mut self) -> Option<Event> {
        self.sample().ok().flatten()
    }

    /// Returns true once a first good sample has been taken.
    pub fn is_seeded(&self) -> bool {
        self.previous.is_some()
    }

    /// Consumes the detector and hands back the source (for release).
    pub fn into_source(self) -> S {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed list of readings; `None` is a read failure.
    struct Scripted {
        readings: VecDeque<Option<bool>>,
        released: bool,
    }

    impl Scripted {
        fn new(readings: &[Option<bool>]) -> Self {
            Scripted {
                readings: readings.iter().copied().collect(),
                released: false,
            }
        }
    }

    impl SensorSource for Scripted {
        fn read(&mut self) -> Result<bool, SensorError> {
            match self.readings.pop_front() {
                Some(Some(level)) => Ok(level),
                Some(None) => Err(SensorError::ReadFailed("scripted".into())),
                None => Err(SensorError::NotInitialized("script exhausted".into())),
            }
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    fn count_events<S: SensorSource>(detector: &mut EdgeDetector<S>, samples: usize) -> usize {
        (0..samples).filter(|_| detector.poll().is_some()).count()
    }

    #[test]
    fn test_first_sample_never_emits() {
        let mut detector = EdgeDetector::new(Scripted::new(&[Some(true)]));
        assert!(detector.poll().is_none());
        assert!(detector.is_seeded());
    }

    #[test]
    fn test_rising_edges_counted() {
        let readings = [Some(false), Some(true), Some(true), Some(false), Some(true), Some(false)];
        let mut detector = EdgeDetector::new(Scripted::new(&readings));
        assert_eq!(count_events(&mut detector, readings.len()), 2);
    }

    #[test]
    fn test_falling_edges_counted() {
        let readings = [Some(true), Some(false), Some(true), Some(false)];
        let mut detector = EdgeDetector::with_edge(Scripted::new(&readings), Edge::Falling);
        assert_eq!(count_events(&mut detector, readings.len()), 2);
    }

    #[test]
    fn test_read_failure_keeps_previous_level() {
        // HIGH, error, HIGH must not look like a LOW→HIGH transition.
        let readings = [Some(false), Some(true), None, Some(true), Some(false), Some(true)];
        let mut detector = EdgeDetector::new(Scripted::new(&readings));
        assert_eq!(count_events(&mut detector, readings.len()), 2);
    }

    #[test]
    fn test_failure_before_seed_does_not_seed() {
        let mut detector = EdgeDetector::new(Scripted::new(&[None, Some(true), Some(true)]));
        assert!(detector.sample().is_err());
        assert!(!detector.is_seeded());
        assert!(detector.poll().is_none());
        assert!(detector.poll().is_none());
    }

    #[test]
    fn test_into_source_allows_release() {
        let detector = EdgeDetector::new(Scripted::new(&[]));
        let mut source = detector.into_source();
        source.release();
        assert!(source.released);
    }
}
