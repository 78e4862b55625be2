// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Smart tape: checkpoint/restore of memory overwritten by a forward sweep.
//!
//! Entries are keyed by address intervals and kept sorted. A single-element
//! key compares against a ranged key by containment, two ranged keys must be
//! identical or disjoint. Any other overlap is a [`TapeIntervalViolation`].

use std::cmp::Ordering;
use std::fmt;

/// Address range `[start, end)`; `end == None` is a single element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: usize,
    pub end: Option<usize>,
}

impl Interval {
    pub fn point(addr: usize) -> Self {
        Interval {
            start: addr,
            end: None,
        }
    }

    pub fn range(start: usize, end: usize) -> Self {
        Interval {
            start,
            end: Some(end.max(start)),
        }
    }

    pub fn is_single_element(&self) -> bool {
        self.end.is_none()
    }

    /// Exclusive upper bound.
    pub fn upper(&self) -> usize {
        self.end.unwrap_or(self.start + 1)
    }

    pub fn len(&self) -> usize {
        self.upper() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order two intervals. `Equal` means the same key, or a point inside a
    /// range.
    pub fn compare(&self, other: &Interval) -> Result<Ordering, TapeIntervalViolation> {
        if self.is_single_element() {
            if self.start < other.start {
                return Ok(Ordering::Less);
            }
            if self.start >= other.upper() {
                return Ok(Ordering::Greater);
            }
            return Ok(Ordering::Equal);
        }
        if other.is_single_element() {
            if other.start < self.start {
                return Ok(Ordering::Greater);
            }
            if other.start >= self.upper() {
                return Ok(Ordering::Less);
            }
            return Ok(Ordering::Equal);
        }
        let violation = || TapeIntervalViolation {
            first: *self,
            second: *other,
        };
        match self.start.cmp(&other.start) {
            Ordering::Equal if self.end == other.end => Ok(Ordering::Equal),
            Ordering::Equal => Err(violation()),
            Ordering::Less if self.upper() <= other.start => Ok(Ordering::Less),
            Ordering::Greater if self.start >= other.upper() => Ok(Ordering::Greater),
            _ => Err(violation()),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}]", self.start),
        }
    }
}

/// Two ranged entries partially overlap. Generated code never does this
/// unless the analysis and the code generator disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tape intervals {first} and {second} partially overlap")]
pub struct TapeIntervalViolation {
    pub first: Interval,
    pub second: Interval,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TapeScalar {
    F64(f64),
    I64(i64),
    Bool(bool),
}

/// Snapshot of a scalar or of a fixed-size aggregate (array, struct).
#[derive(Debug, Clone, PartialEq)]
pub enum TapeValue {
    Scalar(TapeScalar),
    Aggregate(Vec<TapeScalar>),
}

impl TapeValue {
    pub fn len(&self) -> usize {
        match self {
            TapeValue::Scalar(_) => 1,
            TapeValue::Aggregate(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalars(&self) -> &[TapeScalar] {
        match self {
            TapeValue::Scalar(s) => std::slice::from_ref(s),
            TapeValue::Aggregate(items) => items,
        }
    }
}

/// Memory that saved snapshots are written back into.
pub trait RestoreTarget {
    fn write_back(&mut self, start: usize, value: &TapeValue);
}

#[derive(Debug, Clone)]
struct Entry {
    /// `None` for reserved ranges.
    value: Option<TapeValue>,
}

#[derive(Debug, Clone, Default)]
pub struct SmartTape {
    entries: Vec<(Interval, Entry)>,
}

impl SmartTape {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok(i)` if an entry at `i` matches `at`, `Err(i)` with the insertion
    /// point otherwise.
    fn search(&self, at: &Interval) -> Result<Result<usize, usize>, TapeIntervalViolation> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entries[mid].0.compare(at)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Whether `at` is already covered by a stored or reserved entry.
    pub fn contains(&self, at: Interval) -> Result<bool, TapeIntervalViolation> {
        Ok(self.search(&at)?.is_ok())
    }

    /// Save `value` for the location `at` unless the location is already
    /// covered, so the first pre-overwrite value wins. Returns whether a
    /// snapshot was taken.
    pub fn store(&mut self, at: Interval, value: TapeValue) -> Result<bool, TapeIntervalViolation> {
        match self.search(&at)? {
            Ok(_) => Ok(false),
            Err(pos) => {
                self.entries.insert(pos, (at, Entry { value: Some(value) }));
                Ok(true)
            }
        }
    }

    /// Mark `at` as transient: later stores inside it are skipped and
    /// nothing is written back for it.
    pub fn reserve(&mut self, at: Interval) -> Result<(), TapeIntervalViolation> {
        if let Err(pos) = self.search(&at)? {
            self.entries.insert(pos, (at, Entry { value: None }));
        }
        Ok(())
    }

    pub fn ignore(&mut self, start: usize, len: usize) -> Result<(), TapeIntervalViolation> {
        self.reserve(Interval::range(start, start + len))
    }

    /// Write every snapshot back and clear the tape. A second call with no
    /// intervening store does nothing.
    pub fn restore<T: RestoreTarget + ?Sized>(&mut self, target: &mut T) {
        for (at, entry) in self.entries.drain(..) {
            if let Some(value) = &entry.value {
                target.write_back(at.start, value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mem(Vec<f64>);

    impl RestoreTarget for Mem {
        fn write_back(&mut self, start: usize, value: &TapeValue) {
            for (i, s) in value.scalars().iter().enumerate() {
                if let TapeScalar::F64(v) = s {
                    self.0[start + i] = *v;
                }
            }
        }
    }

    fn f(v: f64) -> TapeValue {
        TapeValue::Scalar(TapeScalar::F64(v))
    }

    #[test]
    fn first_store_wins() {
        let mut mem = Mem(vec![1.0, 2.0, 3.0]);
        let mut tape = SmartTape::new();
        assert!(tape.store(Interval::point(1), f(2.0)).unwrap());
        mem.0[1] = 7.0;
        assert!(!tape.store(Interval::point(1), f(7.0)).unwrap());
        mem.0[1] = 9.0;
        tape.restore(&mut mem);
        assert_eq!(mem.0, vec![1.0, 2.0, 3.0]);
        assert!(tape.is_empty());
    }

    #[test]
    fn second_restore_is_noop() {
        let mut mem = Mem(vec![1.0]);
        let mut tape = SmartTape::new();
        tape.store(Interval::point(0), f(1.0)).unwrap();
        tape.restore(&mut mem);
        mem.0[0] = 5.0;
        tape.restore(&mut mem);
        assert_eq!(mem.0[0], 5.0);
    }

    #[test]
    fn point_inside_range_is_contained() {
        let mut tape = SmartTape::new();
        tape.ignore(0, 4).unwrap();
        assert!(tape.contains(Interval::point(2)).unwrap());
        assert!(!tape.contains(Interval::point(4)).unwrap());
        assert_eq!(
            Interval::point(2).compare(&Interval::range(0, 4)).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn partial_overlap_is_a_violation() {
        let mut tape = SmartTape::new();
        tape.reserve(Interval::range(0, 4)).unwrap();
        let err = tape.reserve(Interval::range(2, 6)).unwrap_err();
        assert_eq!(err.first, Interval::range(0, 4));
        assert!(Interval::range(0, 4).compare(&Interval::range(0, 6)).is_err());
        assert_eq!(
            Interval::range(0, 4).compare(&Interval::range(4, 6)).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn stores_inside_reserved_range_are_skipped() {
        let mut mem = Mem(vec![0.0; 6]);
        let mut tape = SmartTape::new();
        tape.ignore(2, 3).unwrap();
        assert!(!tape.store(Interval::point(3), f(1.0)).unwrap());
        assert!(tape.store(Interval::point(5), f(4.0)).unwrap());
        mem.0[5] = -1.0;
        tape.restore(&mut mem);
        assert_eq!(mem.0, vec![0.0, 0.0, 0.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn aggregates_restore_in_place() {
        let mut mem = Mem(vec![1.0, 2.0, 3.0, 4.0]);
        let mut tape = SmartTape::new();
        let snap = TapeValue::Aggregate(vec![TapeScalar::F64(2.0), TapeScalar::F64(3.0)]);
        tape.store(Interval::range(1, 3), snap).unwrap();
        mem.0[1] = 0.0;
        mem.0[2] = 0.0;
        tape.restore(&mut mem);
        assert_eq!(mem.0, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
