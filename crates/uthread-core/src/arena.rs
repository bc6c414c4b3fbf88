//! Generation-checked slot arena.
//!
//! Threads and synchronization objects are addressed by small copyable
//! handles (index + generation). Freeing a slot bumps its generation, so a
//! stale handle never aliases a newer occupant.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Slot {
    index: u32,
    generation: u32,
}

impl Slot {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into a single integer for logs and reports.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

#[derive(Debug, Clone)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

#[derive(Debug, Clone)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Slot {
        self.insert_with(|_| value)
    }

    /// Inserts a value that needs to know its own handle.
    pub fn insert_with(&mut self, make: impl FnOnce(Slot) -> T) -> Slot {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match entry {
                Entry::Vacant { generation } => generation.wrapping_add(1).max(1),
                Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            let slot = Slot { index, generation };
            *entry = Entry::Occupied {
                generation,
                value: make(slot),
            };
            return slot;
        }
        let index = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        let slot = Slot {
            index,
            generation: 1,
        };
        self.entries.push(Entry::Occupied {
            generation: 1,
            value: make(slot),
        });
        slot
    }

    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&T> {
        match self.entries.get(slot.index as usize)? {
            Entry::Occupied { generation, value } if *generation == slot.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut T> {
        match self.entries.get_mut(slot.index as usize)? {
            Entry::Occupied { generation, value } if *generation == slot.generation => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, slot: Slot) -> bool {
        self.get(slot).is_some()
    }

    pub fn remove(&mut self, slot: Slot) -> Option<T> {
        let entry = self.entries.get_mut(slot.index as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == slot.generation => {
                let vacant = Entry::Vacant {
                    generation: slot.generation,
                };
                let Entry::Occupied { value, .. } = std::mem::replace(entry, vacant) else {
                    return None;
                };
                self.free.push(slot.index);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Drops every occupant that `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(Slot, &T) -> bool) {
        for slot in self.slots() {
            let drop_it = self.get(slot).is_some_and(|value| !keep(slot, value));
            if drop_it {
                self.remove(slot);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    Slot {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Slot, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    Slot {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    #[must_use]
    pub fn slots(&self) -> Vec<Slot> {
        self.iter().map(|(slot, _)| slot).collect()
    }
}

/// Declares a typed handle wrapping an arena [`Slot`].
macro_rules! arena_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
        #[serde(transparent)]
        pub struct $name(pub(crate) $crate::arena::Slot);

        impl $name {
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0.as_u64()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}.{}", $prefix, self.0.index(), self.0.generation())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }
    };
}

pub(crate) use arena_handle;
