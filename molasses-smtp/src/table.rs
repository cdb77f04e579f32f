//! The fixed-capacity connection table.
//!
//! Slots are allocated once, sized from the file-descriptor budget, and
//! reused for the life of the process; a closed connection releases its
//! output buffer and nothing else.

use crate::connection::Connection;

/// The table's population counters, split from the slots so a slot can
/// mutate them while it is itself borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    /// Occupied slots.
    pub clients: usize,
    /// Occupied slots with at least one matching blacklist.
    pub black_clients: usize,
    /// Total slots.
    pub capacity: usize,
}

pub struct ConnectionTable {
    pub slots: Vec<Connection>,
    pub counts: Counts,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Connection::default()).collect(),
            counts: Counts {
                clients: 0,
                black_clients: 0,
                capacity,
            },
        }
    }

    /// Index of a free slot, if the table is not full.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Connection::is_free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_free() {
        let table = ConnectionTable::new(4);
        assert_eq!(table.slots.len(), 4);
        assert_eq!(table.free_slot(), Some(0));
        assert_eq!(
            table.counts,
            Counts {
                clients: 0,
                black_clients: 0,
                capacity: 4
            }
        );
    }
}
