//! Slot-indexed storage of the active nonlinear factors.
//!
//! Factors are assigned a dense, monotonically increasing slot index at
//! insertion. Removed factors vacate their slot and the index is never
//! reused. An inverted index from keys to the slots that reference them
//! supports the affected-set computation; its consistency with the live
//! factors is a structural invariant.

use std::collections::{HashMap, HashSet};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};
use crate::factors::Factor;
use crate::linalg::JacobianFactor;

/// The active nonlinear factors, by slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorStore {
    slots: Vec<Option<Factor>>,
    key_index: HashMap<Key, HashSet<usize>>,
}

impl FactorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots ever assigned (including tombstones).
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of live factors.
    pub fn num_live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Append a factor, assigning the next slot.
    pub fn add(&mut self, factor: Factor) -> usize {
        let slot = self.slots.len();
        for &key in factor.keys() {
            self.key_index.entry(key).or_default().insert(slot);
        }
        self.slots.push(Some(factor));
        slot
    }

    /// Remove the factor at `slot`, vacating it. Fails with `UnknownSlot` if
    /// the slot is dead or out of range.
    pub fn remove(&mut self, slot: usize) -> CoreResult<Factor> {
        let factor = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.take())
            .ok_or(CoreError::UnknownSlot { slot })?;
        for key in factor.keys() {
            if let Some(slots) = self.key_index.get_mut(key) {
                slots.remove(&slot);
                if slots.is_empty() {
                    self.key_index.remove(key);
                }
            }
        }
        Ok(factor)
    }

    /// Re-insert a factor into a vacated slot (transaction rollback only).
    pub(crate) fn restore(&mut self, slot: usize, factor: Factor) {
        debug_assert!(self.slots[slot].is_none());
        for &key in factor.keys() {
            self.key_index.entry(key).or_default().insert(slot);
        }
        self.slots[slot] = Some(factor);
    }

    /// Drop the most recently assigned slot (transaction rollback only).
    pub(crate) fn pop(&mut self) {
        if let Some(Some(factor)) = self.slots.pop() {
            let slot = self.slots.len();
            for key in factor.keys() {
                if let Some(slots) = self.key_index.get_mut(key) {
                    slots.remove(&slot);
                    if slots.is_empty() {
                        self.key_index.remove(key);
                    }
                }
            }
        }
    }

    /// The factor at `slot`, if live.
    pub fn get(&self, slot: usize) -> Option<&Factor> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Whether `slot` holds a live factor.
    pub fn is_live(&self, slot: usize) -> bool {
        self.get(slot).is_some()
    }

    /// Iterate over (slot, factor) pairs of live factors.
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Factor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, f)| f.as_ref().map(|f| (slot, f)))
    }

    /// Slots of live factors touching any of the given keys.
    pub fn slots_touching<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> HashSet<usize> {
        let mut slots = HashSet::new();
        for key in keys {
            if let Some(referencing) = self.key_index.get(key) {
                slots.extend(referencing.iter().copied());
            }
        }
        slots
    }

    /// Relinearize the given slots at `values`, producing whitened linear
    /// factors paired with their slots.
    pub fn linearize_slots(
        &self,
        slots: &[usize],
        values: &Values,
        ordering: &Ordering,
    ) -> CoreResult<Vec<(usize, JacobianFactor)>> {
        #[cfg(feature = "parallel")]
        {
            slots
                .par_iter()
                .map(|&slot| {
                    let factor = self
                        .get(slot)
                        .ok_or(CoreError::UnknownSlot { slot })?;
                    Ok((slot, factor.linearize(values, ordering)?))
                })
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            slots
                .iter()
                .map(|&slot| {
                    let factor = self
                        .get(slot)
                        .ok_or(CoreError::UnknownSlot { slot })?;
                    Ok((slot, factor.linearize(values, ordering)?))
                })
                .collect()
        }
    }

    /// Linearize every live factor (used by batch reference solves).
    pub fn linearize_all(
        &self,
        values: &Values,
        ordering: &Ordering,
    ) -> CoreResult<Vec<JacobianFactor>> {
        self.iter_live()
            .map(|(_, factor)| factor.linearize(values, ordering))
            .collect()
    }

    /// Total nonlinear error of the live factors at `values`.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        let mut total = 0.0;
        for (_, factor) in self.iter_live() {
            total += factor.error(values)?;
        }
        Ok(total)
    }

    /// Check the inverted index against the live factors (debug builds).
    #[cfg(debug_assertions)]
    pub(crate) fn check_invariants(&self) {
        for (slot, factor) in self.iter_live() {
            for key in factor.keys() {
                assert!(
                    self.key_index
                        .get(key)
                        .is_some_and(|slots| slots.contains(&slot)),
                    "slot {} missing from index of key {}",
                    slot,
                    key
                );
            }
        }
        for (key, slots) in &self.key_index {
            for slot in slots {
                assert!(
                    self.get(*slot)
                        .is_some_and(|f| f.keys().contains(key)),
                    "index of key {} references dead slot {}",
                    key,
                    slot
                );
            }
        }
    }
}
