//! Per-session event detection and buffering.

use std::collections::VecDeque;

use crate::points::Dnp3PointType;
use crate::scan::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Binary input changes
    One,
    /// Analog input changes beyond the deadband
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventValue {
    Binary(bool),
    Analog(f64),
}

/// Which response carried an event that still awaits confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Solicited,
    Unsolicited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub index: u16,
    pub value: EventValue,
    reported: Option<Report>,
}

impl Event {
    pub fn class(&self) -> EventClass {
        match self.value {
            EventValue::Binary(_) => EventClass::One,
            EventValue::Analog(_) => EventClass::Two,
        }
    }
}

/// Bounded FIFO; the oldest event is dropped on overflow
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<Event>,
    capacity: usize,
    overflow: bool,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            overflow: false,
        }
    }

    pub fn push(&mut self, index: u16, value: EventValue) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.overflow = true;
        }
        self.events.push_back(Event {
            index,
            value,
            reported: None,
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Any buffered event of `class`, reported or not
    pub fn has(&self, class: EventClass) -> bool {
        self.events.iter().any(|e| e.class() == class)
    }

    pub fn has_unreported(&self, class: EventClass) -> bool {
        self.events
            .iter()
            .any(|e| e.class() == class && e.reported.is_none())
    }

    /// Mark up to `limit` unreported events of `class` as carried by `report`
    pub fn select(&mut self, class: EventClass, limit: Option<usize>, report: Report) -> Vec<Event> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut selected = Vec::new();
        for event in self
            .events
            .iter_mut()
            .filter(|e| e.class() == class && e.reported.is_none())
            .take(limit)
        {
            event.reported = Some(report);
            selected.push(event.clone());
        }
        selected
    }

    /// Drop events confirmed by the master
    pub fn confirm(&mut self, report: Report) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.reported != Some(report));
        let removed = before - self.events.len();
        if removed > 0 {
            self.overflow = false;
        }
        removed
    }

    /// Return events of an unconfirmed response to the unreported pool
    pub fn unmark(&mut self, report: Report) {
        for event in self.events.iter_mut().filter(|e| e.reported == Some(report)) {
            event.reported = None;
        }
    }
}

/// Compares successive snapshots against the last reported values
#[derive(Debug)]
pub struct ChangeDetector {
    binary: Vec<Option<bool>>,
    analog: Vec<f64>,
    deadband: f64,
}

impl ChangeDetector {
    pub fn new(snapshot: &Snapshot, deadband: f64) -> Self {
        let mut detector = Self {
            binary: Vec::new(),
            analog: Vec::new(),
            deadband: deadband.max(0.0),
        };
        detector.rebase(snapshot);
        detector
    }

    fn rebase(&mut self, snapshot: &Snapshot) {
        let map = &snapshot.map;
        self.binary = map
            .dnp3_points(Dnp3PointType::BinaryInput)
            .iter()
            .map(|&e| snapshot.image.binary(e))
            .collect();
        self.analog = map
            .dnp3_points(Dnp3PointType::AnalogInput)
            .iter()
            .map(|&e| snapshot.image.value(e).unwrap_or(f64::NAN))
            .collect();
    }

    /// Push events for every change since the last scan, returning how many
    pub fn scan(&mut self, snapshot: &Snapshot, buffer: &mut EventBuffer) -> usize {
        let map = &snapshot.map;
        let binaries = map.dnp3_points(Dnp3PointType::BinaryInput);
        let analogs = map.dnp3_points(Dnp3PointType::AnalogInput);
        if binaries.len() != self.binary.len() || analogs.len() != self.analog.len() {
            self.rebase(snapshot);
            return 0;
        }

        let mut raised = 0;
        for (index, &entry) in binaries.iter().enumerate() {
            let now = snapshot.image.binary(entry);
            if now != self.binary[index] {
                self.binary[index] = now;
                if let Some(value) = now {
                    buffer.push(index as u16, EventValue::Binary(value));
                    raised += 1;
                }
            }
        }
        for (index, &entry) in analogs.iter().enumerate() {
            let Some(now) = snapshot.image.value(entry) else {
                continue;
            };
            let last = self.analog[index];
            let changed = if last.is_nan() || now.is_nan() {
                last.is_nan() != now.is_nan()
            } else {
                (now - last).abs() > self.deadband
            };
            if changed {
                self.analog[index] = now;
                buffer.push(index as u16, EventValue::Analog(now));
                raised += 1;
            }
        }
        raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::three_bus;
    use crate::domain::GridState;
    use crate::points::PointMap;
    use std::sync::Arc;

    fn snapshot(step: u64, edit: impl FnOnce(&mut GridState)) -> Snapshot {
        let topology = Arc::new(three_bus());
        let map = Arc::new(PointMap::build(&topology).unwrap());
        let mut state = GridState::initial(&topology);
        edit(&mut state);
        Snapshot::commit(1, step, topology, map, state)
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = EventBuffer::new(2);
        buffer.push(0, EventValue::Binary(true));
        buffer.push(1, EventValue::Binary(false));
        buffer.push(2, EventValue::Analog(1.0));

        assert!(buffer.overflowed());
        assert_eq!(buffer.len(), 2);
        assert!(buffer.has(EventClass::Two));

        let reported = buffer.select(EventClass::One, None, Report::Solicited);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].index, 1);
        assert_eq!(buffer.confirm(Report::Solicited), 1);
        assert!(!buffer.overflowed());
    }

    #[test]
    fn test_unconfirmed_events_are_reported_again() {
        let mut buffer = EventBuffer::new(8);
        buffer.push(0, EventValue::Analog(1.0));
        buffer.push(1, EventValue::Analog(2.0));

        assert_eq!(buffer.select(EventClass::Two, Some(1), Report::Solicited).len(), 1);
        assert!(buffer.has_unreported(EventClass::Two));
        assert_eq!(buffer.select(EventClass::Two, None, Report::Unsolicited).len(), 1);
        assert!(!buffer.has_unreported(EventClass::Two));

        buffer.unmark(Report::Solicited);
        assert_eq!(buffer.confirm(Report::Unsolicited), 1);
        let again = buffer.select(EventClass::Two, None, Report::Solicited);
        assert_eq!(again[0].value, EventValue::Analog(1.0));
    }

    #[test]
    fn test_detector_respects_deadband() {
        let base = snapshot(0, |_| {});
        let mut detector = ChangeDetector::new(&base, 0.01);
        let mut buffer = EventBuffer::new(16);

        let small = snapshot(1, |s| s.buses[1].voltage_pu += 0.005);
        assert_eq!(detector.scan(&small, &mut buffer), 0);

        let large = snapshot(2, |s| s.buses[1].voltage_pu += 0.05);
        assert_eq!(detector.scan(&large, &mut buffer), 1);
        let events = buffer.select(EventClass::Two, None, Report::Solicited);
        assert_eq!(events[0].index, 1);

        // the baseline moved with the event
        assert_eq!(detector.scan(&large, &mut buffer), 0);
    }

    #[test]
    fn test_detector_raises_breaker_change() {
        let base = snapshot(0, |_| {});
        let mut detector = ChangeDetector::new(&base, 0.01);
        let mut buffer = EventBuffer::new(16);

        let tripped = snapshot(1, |s| s.lines[0].closed = false);
        assert_eq!(detector.scan(&tripped, &mut buffer), 1);
        let events = buffer.select(EventClass::One, None, Report::Solicited);
        assert_eq!(events[0].value, EventValue::Binary(false));
    }
}
