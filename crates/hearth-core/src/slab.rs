// src/slab.rs
//
// Slot table for live connections. A slot is Free, Occupied (the
// dispatcher holds the connection), or CheckedOut (a worker holds it
// via the task queue). Generations invalidate epoll tokens that
// outlive their connection.

use crate::conn::Connection;

enum SlotState {
    Free,
    Occupied(Box<Connection>),
    CheckedOut,
}

struct Slot {
    state: SlotState,
    generation: u32,
}

pub struct ConnectionSlab {
    slots: Vec<Slot>,
    free: Vec<usize>,
    active: usize,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                state: SlotState::Free,
                generation: 0,
            });
        }
        // Lowest indices come off the free list first.
        let free = (0..capacity).rev().collect();
        Self {
            slots,
            free,
            active: 0,
        }
    }

    /// Claim a slot for a new connection. `Err` hands the connection
    /// back when the slab is at capacity.
    pub fn insert(&mut self, conn: Box<Connection>) -> Result<(usize, u32), Box<Connection>> {
        let Some(index) = self.free.pop() else {
            return Err(conn);
        };
        let slot = &mut self.slots[index];
        slot.state = SlotState::Occupied(conn);
        self.active += 1;
        Ok((index, slot.generation))
    }

    /// Whether an epoll token still refers to a live connection.
    pub fn valid(&self, index: usize, generation: u32) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.generation == generation && !matches!(s.state, SlotState::Free))
    }

    pub fn is_checked_out(&self, index: usize, generation: u32) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.generation == generation && matches!(s.state, SlotState::CheckedOut))
    }

    /// Take the connection out for exclusive use (dispatcher I/O or a
    /// worker task). `None` for stale tokens or already-checked-out
    /// slots.
    pub fn check_out(&mut self, index: usize, generation: u32) -> Option<Box<Connection>> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation || !matches!(slot.state, SlotState::Occupied(_)) {
            return None;
        }
        match std::mem::replace(&mut slot.state, SlotState::CheckedOut) {
            SlotState::Occupied(conn) => Some(conn),
            _ => unreachable!("state checked above"),
        }
    }

    /// Return a checked-out connection. `Err` hands it back on a stale
    /// token (its slot was released while it was out).
    pub fn check_in(
        &mut self,
        index: usize,
        generation: u32,
        conn: Box<Connection>,
    ) -> Result<(), Box<Connection>> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && matches!(slot.state, SlotState::CheckedOut) => {
                slot.state = SlotState::Occupied(conn);
                Ok(())
            }
            _ => Err(conn),
        }
    }

    /// Free the slot and bump its generation. Returns the connection if
    /// the dispatcher still held it (the caller closes it); a
    /// checked-out slot frees with the connection owned elsewhere.
    pub fn release(&mut self, index: usize, generation: u32) -> Option<Box<Connection>> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation || matches!(slot.state, SlotState::Free) {
            return None;
        }
        let prev = std::mem::replace(&mut slot.state, SlotState::Free);
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.active -= 1;
        match prev {
            SlotState::Occupied(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Empty every occupied slot for shutdown; checked-out connections
    /// are dropped by whichever worker holds them.
    pub fn drain(&mut self) -> Vec<Box<Connection>> {
        let mut held = Vec::new();
        for index in 0..self.slots.len() {
            let generation = self.slots[index].generation;
            if !matches!(self.slots[index].state, SlotState::Free) {
                if let Some(conn) = self.release(index, generation) {
                    held.push(conn);
                }
            }
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;

    fn conn() -> Box<Connection> {
        // Sentinel fd: Connection::drop skips negative descriptors.
        Connection::new(-1, "127.0.0.1:0".parse().unwrap(), TriggerMode::Level)
    }

    #[test]
    fn insert_checkout_checkin_roundtrip() {
        let mut slab = ConnectionSlab::new(4);
        let (slot, generation) = slab.insert(conn()).unwrap();
        assert_eq!(slot, 0);
        assert!(slab.valid(slot, generation));
        assert!(!slab.is_checked_out(slot, generation));

        let held = slab.check_out(slot, generation).unwrap();
        assert!(slab.is_checked_out(slot, generation));
        // A second checkout of the same slot is refused.
        assert!(slab.check_out(slot, generation).is_none());

        slab.check_in(slot, generation, held).unwrap();
        assert!(slab.valid(slot, generation));
        assert_eq!(slab.active(), 1);
    }

    #[test]
    fn capacity_overflow_returns_the_connection() {
        let mut slab = ConnectionSlab::new(2);
        slab.insert(conn()).unwrap();
        slab.insert(conn()).unwrap();
        assert!(slab.insert(conn()).is_err());
        assert_eq!(slab.active(), 2);
    }

    #[test]
    fn release_bumps_the_generation() {
        let mut slab = ConnectionSlab::new(2);
        let (slot, generation) = slab.insert(conn()).unwrap();
        assert!(slab.release(slot, generation).is_some());
        assert!(!slab.valid(slot, generation));
        assert_eq!(slab.active(), 0);

        // The slot is reused with a new generation; old tokens stay dead.
        let (slot2, gen2) = slab.insert(conn()).unwrap();
        assert_eq!(slot2, slot);
        assert_ne!(gen2, generation);
        assert!(!slab.valid(slot, generation));
        assert!(slab.valid(slot2, gen2));
    }

    #[test]
    fn release_of_a_checked_out_slot_keeps_ownership_outside() {
        let mut slab = ConnectionSlab::new(2);
        let (slot, generation) = slab.insert(conn()).unwrap();
        let held = slab.check_out(slot, generation).unwrap();

        // Torn down while a worker holds it: the slab frees the slot
        // but does not produce a second owner.
        assert!(slab.release(slot, generation).is_none());
        // The straggler's check-in is refused and hands the box back.
        assert!(slab.check_in(slot, generation, held).is_err());
    }

    #[test]
    fn drain_empties_occupied_slots() {
        let mut slab = ConnectionSlab::new(4);
        slab.insert(conn()).unwrap();
        slab.insert(conn()).unwrap();
        let (slot, generation) = slab.insert(conn()).unwrap();
        let _held = slab.check_out(slot, generation).unwrap();

        let drained = slab.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(slab.active(), 0);
    }
}
