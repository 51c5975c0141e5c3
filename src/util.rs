//! Internal utilities.

use std::fmt::{Debug, Formatter};

/// Returns a string representation of the specified type.
macro_rules! name_of {
    ($t:ty) => {{
        type _T = $t; // Allows $t to be recognized as a type for refactoring
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Generation-checked index into a [`Pool`]. A `Slot` obtained from one
/// allocation never resolves to a later occupant of the same index.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Slot {
    idx: u16,
    gen: u16,
}

impl Slot {
    /// Returns the pool index, stable for the lifetime of the allocation.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn index(self) -> u16 {
        self.idx
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}.{})", name_of!(Slot), self.idx, self.gen)
    }
}

/// Fixed-capacity pool with first-free-slot allocation. Freeing a slot bumps
/// its generation, invalidating any outstanding [`Slot`] for that index.
#[derive(Debug)]
pub(crate) struct Pool<T> {
    ent: Box<[Entry<T>]>,
}

#[derive(Debug)]
struct Entry<T> {
    gen: u16,
    val: Option<T>,
}

impl<T> Pool<T> {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        assert!(cap <= usize::from(u16::MAX));
        let mut ent = Vec::with_capacity(cap);
        ent.resize_with(cap, || Entry { gen: 0, val: None });
        Self {
            ent: ent.into_boxed_slice(),
        }
    }

    /// Stores `v` in the first free slot. Returns `None` if the pool is full.
    pub fn alloc(&mut self, v: T) -> Option<Slot> {
        let (idx, e) = (self.ent.iter_mut().enumerate()).find(|(_, e)| e.val.is_none())?;
        e.val = Some(v);
        #[allow(clippy::cast_possible_truncation)]
        Some(Slot {
            idx: idx as u16,
            gen: e.gen,
        })
    }

    /// Removes and returns the value at `s`, invalidating the slot.
    pub fn free(&mut self, s: Slot) -> Option<T> {
        let e = self.ent.get_mut(usize::from(s.idx))?;
        if e.gen != s.gen {
            return None;
        }
        let v = e.val.take();
        if v.is_some() {
            e.gen = e.gen.wrapping_add(1);
        }
        v
    }

    #[must_use]
    pub fn get(&self, s: Slot) -> Option<&T> {
        let e = self.ent.get(usize::from(s.idx))?;
        (e.gen == s.gen).then_some(e.val.as_ref()).flatten()
    }

    #[must_use]
    pub fn get_mut(&mut self, s: Slot) -> Option<&mut T> {
        let e = self.ent.get_mut(usize::from(s.idx))?;
        (e.gen == s.gen).then_some(e.val.as_mut()).flatten()
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ent.iter().filter(|e| e.val.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> {
        self.ent.iter().enumerate().filter_map(|(idx, e)| {
            #[allow(clippy::cast_possible_truncation)]
            let s = Slot {
                idx: idx as u16,
                gen: e.gen,
            };
            e.val.as_ref().map(|v| (s, v))
        })
    }

    /// Returns the slot whose value matches `f`, if any.
    #[must_use]
    pub fn find(&self, mut f: impl FnMut(&T) -> bool) -> Option<Slot> {
        self.iter().find(|(_, v)| f(v)).map(|(s, _)| s)
    }
}
