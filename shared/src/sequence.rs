use thiserror::Error;

const HALF_RANGE: u32 = 1 << 31;

/// Returns whether a wrapping u32 sequence number is greater than another.
/// seq_greater_than(2,1) will return true
/// seq_greater_than(1,2) will return false
/// seq_greater_than(1,1) will return false
pub fn seq_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// Returns whether a wrapping u32 sequence number is less than another.
pub fn seq_less_than(s1: u32, s2: u32) -> bool {
    seq_greater_than(s2, s1)
}

/// Retrieves the wrapping difference `b − a` between two u32 sequence
/// numbers. The result is exact whenever the true distance fits in an i32,
/// which the transport guarantees by bounding its windows far below the
/// half range.
pub fn seq_diff(a: u32, b: u32) -> i32 {
    b.wrapping_sub(a) as i32
}

/// Errors that can occur during [`SequenceList`] operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// Attempted to insert a duplicate ID into the sequence list
    #[error("Duplicate sequence ID {id} not allowed in SequenceList")]
    DuplicateId { id: u32 },
}

/// A list of items keyed by wrapping u32 sequence ids, kept in sequence
/// order. Scans run from the back because in practice insertions arrive
/// near the tail.
pub struct SequenceList<T> {
    list: Vec<(u32, T)>,
}

impl<T> SequenceList<T> {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn front(&self) -> Option<&(u32, T)> {
        self.list.first()
    }

    pub fn pop_front(&mut self) -> Option<(u32, T)> {
        if self.list.is_empty() {
            return None;
        }
        Some(self.list.remove(0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, T)> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (u32, T)> {
        self.list.iter_mut()
    }

    pub fn contains(&self, id: u32) -> bool {
        for (old_id, _) in self.list.iter().rev() {
            if *old_id == id {
                return true;
            }
            if seq_less_than(*old_id, id) {
                return false;
            }
        }
        false
    }

    /// Attempts to insert an item with the given ID, scanning from the back.
    /// Returns an error if the ID already exists.
    pub fn try_insert(&mut self, id: u32, item: T) -> Result<(), SequenceError> {
        let mut index = self.list.len();

        loop {
            if index == 0 {
                // made it all the way through, insert at front and be done
                self.list.insert(index, (id, item));
                return Ok(());
            }

            index -= 1;

            let (old_id, _) = &self.list[index];
            if *old_id == id {
                return Err(SequenceError::DuplicateId { id });
            }
            if seq_less_than(*old_id, id) {
                self.list.insert(index + 1, (id, item));
                return Ok(());
            }
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let position = self.list.iter().position(|(old_id, _)| *old_id == id)?;
        Some(self.list.remove(position).1)
    }
}

impl<T> Default for SequenceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod seq_compare_tests {
    use super::{seq_greater_than, seq_less_than};

    #[test]
    fn greater_is_greater() {
        assert!(seq_greater_than(2, 1));
    }

    #[test]
    fn greater_is_not_equal() {
        assert!(!seq_greater_than(2, 2));
    }

    #[test]
    fn greater_is_not_less() {
        assert!(!seq_greater_than(1, 2));
    }

    #[test]
    fn less_is_less() {
        assert!(seq_less_than(1, 2));
    }

    #[test]
    fn less_is_not_equal() {
        assert!(!seq_less_than(2, 2));
    }

    #[test]
    fn less_is_not_greater() {
        assert!(!seq_less_than(2, 1));
    }

    #[test]
    fn comparison_survives_wrap() {
        let a: u32 = u32::MAX;
        let b: u32 = a.wrapping_add(2);
        assert!(seq_greater_than(b, a));
        assert!(seq_less_than(a, b));
    }
}
