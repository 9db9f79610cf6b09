//! Small-integer id tables.
//!
//! Ids start at 1 (0 means "unused" on the wire) and are recycled through a
//! FIFO free list, so a just-freed id is the last to come back. An id names
//! an entry only for as long as the entry is in the table.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct IdArena<T> {
    slots: Vec<Option<T>>,
    free: VecDeque<u32>,
    len: usize,
    max: u32,
}

impl<T> IdArena<T> {
    /// A table handing out ids in `1..=max`.
    pub fn new(max: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            len: 0,
            max,
        }
    }

    /// Stores `value` and returns its id, or gives the value back when full.
    pub fn insert(&mut self, value: T) -> Result<u32, T> {
        match self.insert_placeholder() {
            Some(id) => {
                self.slots[(id - 1) as usize] = Some(value);
                Ok(id)
            }
            None => Err(value),
        }
    }

    /// Stores the value built from its own id.
    pub fn insert_with<F: FnOnce(u32) -> T>(&mut self, build: F) -> Option<u32> {
        let id = self.insert_placeholder()?;
        self.slots[(id - 1) as usize] = Some(build(id));
        Some(id)
    }

    fn insert_placeholder(&mut self) -> Option<u32> {
        let id = match self.free.pop_front() {
            Some(id) => id,
            None => {
                let next = self.slots.len() as u32 + 1;
                if next > self.max {
                    return None;
                }
                self.slots.push(None);
                next
            }
        };
        self.len += 1;
        Some(id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        let idx = id.checked_sub(1)? as usize;
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let idx = id.checked_sub(1)? as usize;
        self.slots.get_mut(idx)?.as_mut()
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let idx = id.checked_sub(1)? as usize;
        let value = self.slots.get_mut(idx)?.take()?;
        self.free.push_back(id);
        self.len -= 1;
        Some(value)
    }

    /// Removes every entry, yielding them with their ids.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let mut out = Vec::with_capacity(self.len);
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                let id = idx as u32 + 1;
                self.free.push_back(id);
                out.push((id, value));
            }
        }
        self.len = 0;
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|v| (idx as u32 + 1, v)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_recycle_fifo() {
        let mut arena = IdArena::new(8);
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        let c = arena.insert("c").unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(arena.remove(b), Some("b"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.insert("d").unwrap(), 2);
        assert_eq!(arena.insert("e").unwrap(), 1);
        assert_eq!(arena.get(0), None);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn full_table_returns_value() {
        let mut arena = IdArena::new(1);
        arena.insert(1).unwrap();
        assert_eq!(arena.insert(2), Err(2));
        assert_eq!(arena.insert_with(|id| id), None);
    }

    #[test]
    fn insert_with_sees_its_id() {
        let mut arena = IdArena::new(4);
        let id = arena.insert_with(|id| id * 10).unwrap();
        assert_eq!(arena.get(id), Some(&(id * 10)));
        assert_eq!(arena.drain(), vec![(id, id * 10)]);
        assert!(arena.is_empty());
    }
}
