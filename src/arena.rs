//! Per-queue storage for call instances, addressed by [`CallTag`].
//!
//! The transport only ever sees tags. A worker resolves a tag by *taking* the
//! instance out of its slot, advances it without holding the lock, then either
//! restores it or releases the slot. Releasing bumps the slot generation so a
//! late event carrying the old tag resolves to nothing.

use crate::queue::CallTag;
use parking_lot::Mutex;

enum SlotState<T> {
    Vacant,
    Occupied(T),
    /// Checked out by the worker currently advancing it.
    Taken,
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

pub(crate) struct Arena<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub(crate) fn insert(&self, value: T) -> CallTag {
        let mut slots = self.slots.lock();
        slots.live += 1;
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.state = SlotState::Occupied(value);
            return CallTag::new(index, slot.generation);
        }
        let index = slots.entries.len() as u32;
        slots.entries.push(Slot {
            generation: 0,
            state: SlotState::Occupied(value),
        });
        CallTag::new(index, 0)
    }

    /// Checks the value out of its slot. `None` for stale or unknown tags and
    /// for values already checked out.
    pub(crate) fn take(&self, tag: CallTag) -> Option<T> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.get_mut(tag.slot() as usize)?;
        if slot.generation != tag.generation() {
            return None;
        }
        match std::mem::replace(&mut slot.state, SlotState::Taken) {
            SlotState::Occupied(value) => Some(value),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Puts a checked-out value back under the same tag.
    pub(crate) fn restore(&self, tag: CallTag, value: T) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.entries.get_mut(tag.slot() as usize) {
            if slot.generation == tag.generation() && matches!(slot.state, SlotState::Taken) {
                slot.state = SlotState::Occupied(value);
            }
        }
    }

    /// Frees a checked-out slot.
    pub(crate) fn release(&self, tag: CallTag) {
        let mut slots = self.slots.lock();
        let freed = match slots.entries.get_mut(tag.slot() as usize) {
            Some(slot)
                if slot.generation == tag.generation() && matches!(slot.state, SlotState::Taken) =>
            {
                slot.state = SlotState::Vacant;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        };
        if freed {
            slots.free.push(tag.slot());
            slots.live -= 1;
        }
    }

    /// Removes a value that was never checked out.
    pub(crate) fn remove(&self, tag: CallTag) -> Option<T> {
        let value = self.take(tag)?;
        self.release(tag);
        Some(value)
    }

    /// Removes every occupied value. Checked-out slots are left alone.
    pub(crate) fn drain(&self) -> Vec<(CallTag, T)> {
        let mut slots = self.slots.lock();
        let mut drained = Vec::new();
        let mut freed = Vec::new();
        for (index, slot) in slots.entries.iter_mut().enumerate() {
            if let SlotState::Occupied(_) = slot.state {
                if let SlotState::Occupied(value) =
                    std::mem::replace(&mut slot.state, SlotState::Vacant)
                {
                    drained.push((CallTag::new(index as u32, slot.generation), value));
                }
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
            }
        }
        slots.live -= freed.len();
        slots.free.extend(freed);
        drained
    }

    /// Counts occupied values matching `pred`.
    pub(crate) fn count(&self, pred: impl Fn(&T) -> bool) -> usize {
        let slots = self.slots.lock();
        slots
            .entries
            .iter()
            .filter(|slot| match &slot.state {
                SlotState::Occupied(value) => pred(value),
                _ => false,
            })
            .count()
    }

    /// Occupied plus checked-out values.
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_restore_release_cycle() {
        let arena = Arena::new();
        let tag = arena.insert("armed");
        assert_eq!(arena.len(), 1);

        let value = arena.take(tag).unwrap();
        assert_eq!(value, "armed");
        // A checked-out value cannot be taken twice.
        assert!(arena.take(tag).is_none());
        assert_eq!(arena.count(|_| true), 0);

        arena.restore(tag, "processing");
        assert_eq!(arena.count(|v| *v == "processing"), 1);

        let _ = arena.take(tag).unwrap();
        arena.release(tag);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_stale_tag_misses_recycled_slot() {
        let arena = Arena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Some(1));

        let second = arena.insert(2);
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
        assert!(arena.take(first).is_none());
        assert_eq!(arena.take(second), Some(2));
    }

    #[test]
    fn test_drain_skips_checked_out_values() {
        let arena = Arena::new();
        let a = arena.insert('a');
        let _b = arena.insert('b');
        let _c = arena.insert('c');
        let taken = arena.take(a).unwrap();
        assert_eq!(taken, 'a');

        let mut drained: Vec<char> = arena.drain().into_iter().map(|(_, v)| v).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec!['b', 'c']);
        assert_eq!(arena.len(), 1);

        arena.release(a);
        assert_eq!(arena.len(), 0);
    }
}
