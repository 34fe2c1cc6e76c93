//! A sink wrapper that gates writes behind user predicates.

use super::{Sink, SinkEventKind, VoiceData};
use crate::id::UserId;

/// A predicate deciding whether one frame reaches the wrapped sink.
pub type FilterFn = Box<dyn FnMut(Option<UserId>, &VoiceData) -> bool + Send>;

/// How multiple predicates combine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FilteringMode {
    /// Every predicate must pass.
    #[default]
    All,
    /// A single passing predicate suffices.
    Any,
}

/// Calls filtering callbacks before writing into its destination.
pub struct FilterSink {
    destination: Box<dyn Sink>,
    filters: Vec<FilterFn>,
    mode: FilteringMode,
}

impl FilterSink {
    /// Wraps `destination` behind the given predicates.
    ///
    /// # Panics
    /// Panics when `filters` is empty; a filter sink without predicates is
    /// a configuration mistake.
    #[must_use]
    pub fn new(destination: Box<dyn Sink>, filters: Vec<FilterFn>, mode: FilteringMode) -> Self {
        assert!(
            !filters.is_empty(),
            "FilterSink requires at least one predicate"
        );

        Self {
            destination,
            filters,
            mode,
        }
    }
}

impl Sink for FilterSink {
    fn is_opus(&self) -> bool {
        self.destination.is_opus()
    }

    fn write(&mut self, user: Option<UserId>, data: &VoiceData) {
        let passed = match self.mode {
            FilteringMode::All => self.filters.iter_mut().all(|f| f(user, data)),
            FilteringMode::Any => self.filters.iter_mut().any(|f| f(user, data)),
        };

        if passed {
            self.destination.write(user, data);
        }
    }

    fn cleanup(&mut self) {
        self.filters.clear();
        self.destination.cleanup();
    }

    fn for_each_child(&mut self, f: &mut dyn FnMut(&mut dyn Sink)) {
        f(self.destination.as_mut());
    }

    fn listens_to(&self) -> &'static [SinkEventKind] {
        &[]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::test::{frame, Probe, ProbeSink};

    fn probe_sink(probe: &Probe) -> Box<dyn Sink> {
        Box::new(ProbeSink {
            probe: probe.clone(),
            opus: false,
        })
    }

    #[test]
    fn all_mode_requires_every_predicate() {
        let probe = Probe::default();
        let mut sink = FilterSink::new(
            probe_sink(&probe),
            vec![
                Box::new(|_, data| data.packet.sequence() % 2 == 0),
                Box::new(|_, data| data.packet.sequence() < 10),
            ],
            FilteringMode::All,
        );

        for seq in 0..20 {
            sink.write(None, &frame(seq));
        }

        let seen: Vec<u16> = probe.frames.lock().unwrap().iter().map(|f| f.0).collect();
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn any_mode_requires_one_predicate() {
        let probe = Probe::default();
        let mut sink = FilterSink::new(
            probe_sink(&probe),
            vec![
                Box::new(|_, data| data.packet.sequence() == 1),
                Box::new(|_, data| data.packet.sequence() == 3),
            ],
            FilteringMode::Any,
        );

        for seq in 0..5 {
            sink.write(None, &frame(seq));
        }

        let seen: Vec<u16> = probe.frames.lock().unwrap().iter().map(|f| f.0).collect();
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn cleanup_reaches_destination() {
        let probe = Probe::default();
        let mut sink = FilterSink::new(
            probe_sink(&probe),
            vec![Box::new(|_, _| true)],
            FilteringMode::All,
        );

        sink.cleanup();
        assert_eq!(probe.cleanups.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
