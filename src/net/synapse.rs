use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};

/// A run of weight-table indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInterval {
    pub start: u32,
    pub size: u32,
}

impl IndexInterval {
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }
}

/// A run of input indices. A negative `start` encodes external inputs:
/// successive elements decrement, so `start = -1, size = 3` walks the
/// external inputs 0, 1, 2. `reach_past` is the temporal offset of the run;
/// 0 reads the current step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInterval {
    pub start: i32,
    pub size: u32,
    pub reach_past: u32,
}

impl InputInterval {
    pub fn new(start: i32, size: u32) -> Self {
        Self {
            start,
            size,
            reach_past: 0,
        }
    }

    pub fn with_reach(start: i32, size: u32, reach_past: u32) -> Self {
        Self {
            start,
            size,
            reach_past,
        }
    }
}

/// Capability shared by the two interval records, so one iterator serves
/// neuron routing, partial solving and input collection alike.
pub trait Interval: Copy {
    fn starts(&self) -> i32;
    fn interval_size(&self) -> u32;
    fn reach_past(&self) -> u32 {
        0
    }
}

impl Interval for IndexInterval {
    fn starts(&self) -> i32 {
        self.start as i32
    }

    fn interval_size(&self) -> u32 {
        self.size
    }
}

impl Interval for InputInterval {
    fn starts(&self) -> i32 {
        self.start
    }

    fn interval_size(&self) -> u32 {
        self.size
    }

    fn reach_past(&self) -> u32 {
        self.reach_past
    }
}

/// True when the index is taken from the external inputs rather than from
/// internal neuron data.
pub fn is_external(index: i32) -> bool {
    index < 0
}

/// Convert an external array index `[0..n]` into the merged synapse index
/// space `[-1..-n-1]`.
pub fn external_from_array(index: usize) -> i32 {
    -(index as i32) - 1
}

/// Convert a merged synapse index back into external array range. The index
/// must be negative.
pub fn array_from_external(index: i32) -> usize {
    debug_assert!(index < 0, "queried external array index of {index}");
    (-1 - index) as usize
}

/// Walks the logical element indices described by a run-length-encoded
/// interval list. Intervals with a negative start decrement per element;
/// all others increment.
#[derive(Clone, Copy)]
pub struct SynapseIterator<'a, T: Interval> {
    intervals: &'a [T],
}

impl<'a, T: Interval> SynapseIterator<'a, T> {
    pub fn new(intervals: &'a [T]) -> Self {
        Self { intervals }
    }

    /// Overall number of elements described by the intervals.
    pub fn size(&self) -> usize {
        self.intervals
            .iter()
            .map(|interval| interval.interval_size() as usize)
            .sum()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// The element ordinal the given interval starts at, were the runs
    /// expanded element by element.
    pub fn interval_starts_at(&self, interval_index: usize) -> usize {
        self.intervals[..interval_index]
            .iter()
            .map(|interval| interval.interval_size() as usize)
            .sum()
    }

    /// Iterate every element index.
    pub fn iterate<F: FnMut(i32)>(&self, mut for_each_index: F) {
        self.iterate_terminatable(|index| {
            for_each_index(index);
            true
        });
    }

    /// Iterate every (interval, element index) pair.
    pub fn iterate_with_intervals<F: FnMut(&T, i32)>(&self, mut for_each: F) {
        for interval in self.intervals {
            expand(interval, |index| {
                for_each(interval, index);
                true
            });
        }
    }

    /// Iterate element indices until the callback asks to stop. Returns
    /// whether the iteration ran to completion.
    pub fn iterate_terminatable<F: FnMut(i32) -> bool>(&self, mut for_each_index: F) -> bool {
        for interval in self.intervals {
            if !expand(interval, &mut for_each_index) {
                return false;
            }
        }
        true
    }

    /// Like [`iterate_terminatable`](Self::iterate_terminatable), with the
    /// owning interval passed alongside each element.
    pub fn iterate_with_intervals_terminatable<F: FnMut(&T, i32) -> bool>(
        &self,
        mut for_each: F,
    ) -> bool {
        for interval in self.intervals {
            if !expand(interval, |index| for_each(interval, index)) {
                return false;
            }
        }
        true
    }

    /// Visit each interval without expanding its elements.
    pub fn skim<F: FnMut(&T)>(&self, mut for_each_interval: F) {
        for interval in self.intervals {
            for_each_interval(interval);
        }
    }

    /// Visit intervals until the callback asks to stop.
    pub fn skim_terminatable<F: FnMut(&T) -> bool>(&self, mut for_each_interval: F) {
        for interval in self.intervals {
            if !for_each_interval(interval) {
                return;
            }
        }
    }

    /// Direct access to the element at the given iteration ordinal.
    pub fn index_at(&self, nth_element: usize) -> LatResult<i32> {
        let (interval, offset) = self.locate(nth_element)?;
        Ok(element_of(interval, offset))
    }

    /// Size of the interval containing the element at the given ordinal.
    pub fn interval_size_of(&self, nth_element: usize) -> LatResult<u32> {
        Ok(self.locate(nth_element)?.0.interval_size())
    }

    /// Temporal offset of the interval containing the element at the given
    /// ordinal.
    pub fn reach_past_of(&self, nth_element: usize) -> LatResult<u32> {
        Ok(self.locate(nth_element)?.0.reach_past())
    }

    /// The last element index of the synapse.
    pub fn back(&self) -> LatResult<i32> {
        let interval = self
            .intervals
            .last()
            .ok_or(LatticaError::IndexOutOfBounds {
                what: "synapse interval",
                index: 0,
                bound: 0,
            })?;
        Ok(element_of(interval, interval.interval_size() as usize - 1))
    }

    fn locate(&self, nth_element: usize) -> LatResult<(&T, usize)> {
        let mut remaining = nth_element;
        for interval in self.intervals {
            let size = interval.interval_size() as usize;
            if remaining < size {
                return Ok((interval, remaining));
            }
            remaining -= size;
        }
        Err(LatticaError::IndexOutOfBounds {
            what: "synapse element",
            index: nth_element,
            bound: self.size(),
        })
    }
}

fn element_of<T: Interval>(interval: &T, offset: usize) -> i32 {
    if is_external(interval.starts()) {
        interval.starts() - offset as i32
    } else {
        interval.starts() + offset as i32
    }
}

fn expand<T: Interval, F: FnMut(i32) -> bool>(interval: &T, mut for_each_index: F) -> bool {
    let start = interval.starts();
    for offset in 0..interval.interval_size() as i32 {
        let index = if is_external(start) {
            start - offset
        } else {
            start + offset
        };
        if !for_each_index(index) {
            return false;
        }
    }
    true
}
