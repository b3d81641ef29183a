//! Image slot bookkeeping shared by both swapchain variants.
//!
//! Slots are handed out in ring order. An acquired slot goes through an
//! optional wait, is released, and stays released (acquirable again) until the
//! ring comes back around to it.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{LayerError, LayerResult};

/// State of one image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never acquired.
    Free,
    /// Acquired by the application, not yet waited.
    Acquired,
    /// Acquired and waited; the application may render.
    Waited,
    /// Released by the application; acquirable again.
    Released,
    /// Handed out by the runtime but failed before the application got it.
    /// Keeps its place in the hold order until handed back.
    Discarded,
}

impl SlotState {
    fn is_held(self) -> bool {
        matches!(self, SlotState::Acquired | SlotState::Waited | SlotState::Discarded)
    }
}

#[derive(Debug)]
struct Slots {
    states: Vec<SlotState>,
    /// Next slot in ring order.
    next: usize,
    /// Held slots, oldest first.
    held: VecDeque<u32>,
    last_released: Option<u32>,
}

/// Ring of image slots with blocking and non-blocking acquire.
#[derive(Debug)]
pub struct SlotTable {
    label: String,
    slots: Mutex<Slots>,
    released: Condvar,
}

impl SlotTable {
    pub fn new(label: impl Into<String>, len: u32) -> Self {
        Self {
            label: label.into(),
            slots: Mutex::new(Slots {
                states: vec![SlotState::Free; len as usize],
                next: 0,
                held: VecDeque::new(),
                last_released: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.slots.lock().states.len() as u32
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slots.lock().states.get(index as usize).copied()
    }

    /// Slot the next acquire will hand out.
    pub fn peek_next(&self) -> u32 {
        self.slots.lock().next as u32
    }

    /// Acquire the next slot in ring order.
    pub fn acquire(&self, wait: bool) -> LayerResult<u32> {
        let mut slots = self.slots.lock();
        if slots.states.is_empty() {
            return Err(LayerError::Configuration(format!("{} has no images", self.label)));
        }

        loop {
            let index = slots.next;
            if !slots.states[index].is_held() {
                break;
            }
            if !wait {
                return Err(LayerError::Busy(format!(
                    "{} image {} is still acquired",
                    self.label, index
                )));
            }
            self.released.wait(&mut slots);
        }

        let index = slots.next;
        if slots.last_released == Some(index as u32) {
            log::debug!(
                "[SWAPCHAIN] {} re-acquires image {} before it was consumed",
                self.label,
                index
            );
            slots.last_released = None;
        }
        slots.states[index] = SlotState::Acquired;
        slots.held.push_back(index as u32);
        slots.next = (index + 1) % slots.states.len();
        Ok(index as u32)
    }

    /// Undo the acquire of `index` after a failure further down.
    pub fn abandon(&self, index: u32) {
        let mut slots = self.slots.lock();
        if slots.held.back() == Some(&index) {
            slots.held.pop_back();
            slots.states[index as usize] = SlotState::Free;
            slots.next = index as usize;
            self.released.notify_all();
        }
    }

    /// Take `index` away from the application without rewinding the ring.
    pub fn discard(&self, index: u32) {
        let mut slots = self.slots.lock();
        if slots.held.contains(&index) {
            slots.states[index as usize] = SlotState::Discarded;
        }
    }

    /// Pop the discarded slots at the front of the hold order, oldest first.
    pub fn take_discarded(&self) -> Vec<u32> {
        let mut slots = self.slots.lock();
        let mut taken = Vec::new();
        while let Some(&index) = slots.held.front() {
            if slots.states[index as usize] != SlotState::Discarded {
                break;
            }
            slots.held.pop_front();
            slots.states[index as usize] = SlotState::Released;
            taken.push(index);
        }
        if !taken.is_empty() {
            self.released.notify_all();
        }
        taken
    }

    /// Mark the oldest acquired slot as waited.
    pub fn wait(&self) -> LayerResult<u32> {
        let mut slots = self.slots.lock();
        let Some(&index) = slots.held.front() else {
            return Err(LayerError::InvalidCallOrder(format!(
                "{} has no acquired image to wait on",
                self.label
            )));
        };
        if slots.states[index as usize] == SlotState::Waited {
            return Err(LayerError::InvalidCallOrder(format!(
                "{} image {} was already waited",
                self.label, index
            )));
        }
        slots.states[index as usize] = SlotState::Waited;
        Ok(index)
    }

    /// Release the oldest acquired slot.
    pub fn release(&self) -> LayerResult<u32> {
        let mut slots = self.slots.lock();
        let Some(index) = slots.held.pop_front() else {
            return Err(LayerError::InvalidCallOrder(format!(
                "{} has no acquired image to release",
                self.label
            )));
        };
        slots.states[index as usize] = SlotState::Released;
        slots.last_released = Some(index);
        self.released.notify_all();
        Ok(index)
    }

    pub fn last_released(&self) -> Option<u32> {
        self.slots.lock().last_released
    }

    /// Consume the last released slot.
    pub fn take_last_released(&self) -> Option<u32> {
        self.slots.lock().last_released.take()
    }

    pub fn held(&self) -> usize {
        self.slots.lock().held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ring_order() {
        let table = SlotTable::new("test", 3);
        assert_eq!(table.acquire(false).unwrap(), 0);
        table.release().unwrap();
        assert_eq!(table.acquire(false).unwrap(), 1);
        table.release().unwrap();
        assert_eq!(table.acquire(false).unwrap(), 2);
        table.release().unwrap();
        assert_eq!(table.acquire(false).unwrap(), 0);
    }

    #[test]
    fn test_busy_when_ring_is_full() {
        let table = SlotTable::new("test", 2);
        table.acquire(false).unwrap();
        table.acquire(false).unwrap();
        let err = table.acquire(false).unwrap_err();
        assert!(err.is_recoverable());

        assert_eq!(table.release().unwrap(), 0);
        assert_eq!(table.acquire(false).unwrap(), 0);
    }

    #[test]
    fn test_wait_only_once() {
        let table = SlotTable::new("test", 3);
        assert!(matches!(table.wait(), Err(LayerError::InvalidCallOrder(_))));
        table.acquire(false).unwrap();
        table.acquire(false).unwrap();
        assert_eq!(table.wait().unwrap(), 0);
        assert!(matches!(table.wait(), Err(LayerError::InvalidCallOrder(_))));
        table.release().unwrap();
        assert_eq!(table.wait().unwrap(), 1);
    }

    #[test]
    fn test_release_without_acquire() {
        let table = SlotTable::new("test", 2);
        assert!(matches!(table.release(), Err(LayerError::InvalidCallOrder(_))));
    }

    #[test]
    fn test_last_released_tracking() {
        let table = SlotTable::new("test", 2);
        assert_eq!(table.last_released(), None);
        table.acquire(false).unwrap();
        table.release().unwrap();
        assert_eq!(table.last_released(), Some(0));
        assert_eq!(table.take_last_released(), Some(0));
        assert_eq!(table.take_last_released(), None);
    }

    #[test]
    fn test_reacquire_drops_pending_hand_off() {
        let table = SlotTable::new("test", 1);
        table.acquire(false).unwrap();
        table.release().unwrap();
        assert_eq!(table.last_released(), Some(0));
        table.acquire(false).unwrap();
        assert_eq!(table.last_released(), None);
    }

    #[test]
    fn test_abandon_restores_slot() {
        let table = SlotTable::new("test", 2);
        let index = table.acquire(false).unwrap();
        table.abandon(index);
        assert_eq!(table.state(index), Some(SlotState::Free));
        assert_eq!(table.held(), 0);
        assert_eq!(table.acquire(false).unwrap(), index);
    }

    #[test]
    fn test_discarded_slot_keeps_ring_position() {
        let table = SlotTable::new("test", 3);
        assert_eq!(table.acquire(false).unwrap(), 0);
        assert_eq!(table.acquire(false).unwrap(), 1);
        table.discard(1);
        assert_eq!(table.state(1), Some(SlotState::Discarded));

        // Still behind image 0.
        assert!(table.take_discarded().is_empty());
        assert_eq!(table.release().unwrap(), 0);
        assert_eq!(table.take_discarded(), vec![1]);
        assert_eq!(table.held(), 0);
        assert_eq!(table.last_released(), Some(0));
        assert_eq!(table.acquire(false).unwrap(), 2);
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let table = Arc::new(SlotTable::new("test", 1));
        table.acquire(false).unwrap();

        let releaser = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                table.release().unwrap();
            })
        };

        assert_eq!(table.acquire(true).unwrap(), 0);
        assert_eq!(table.state(0), Some(SlotState::Acquired));
        releaser.join().unwrap();
    }
}
