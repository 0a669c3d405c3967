//! Dense entity handles and the flat owned arenas behind them.
//!
//! Every IR object lives in an [`EntityDefs`] arena owned by
//! [`FuncBody`](crate::FuncBody), and is referred to by a typed `u32` handle.
//! Handles stay valid across structural edits (blocks are detached, never
//! shifted), which is what makes in-place CFG surgery safe to interleave
//! with iteration over previously collected handles.

use std::marker::PhantomData;

/// Implemented by the typed `u32` handles declared with `entities!`.
pub trait EntityHandle: Copy + Eq + std::hash::Hash {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! entities {
    ($($(#[$attr:meta])* $name:ident = $prefix:literal),+ $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(u32);

            impl EntityHandle for $name {
                fn from_index(index: usize) -> Self {
                    Self(u32::try_from(index).expect("entity arena overflowed u32"))
                }
                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )+
    };
}

entities! {
    /// Handle for a [`BlockDef`](crate::BlockDef).
    Block = "b",
    /// Handle for an [`InstDef`](crate::InstDef).
    Inst = "v",
    /// Handle for a [`ConstDef`](crate::ConstDef).
    Const = "c",
}

/// Append-only arena of entity definitions, indexed by their typed handle.
#[derive(Clone)]
pub struct EntityDefs<H: EntityHandle, D> {
    defs: Vec<D>,
    _handle: PhantomData<H>,
}

impl<H: EntityHandle, D> Default for EntityDefs<H, D> {
    fn default() -> Self {
        Self { defs: vec![], _handle: PhantomData }
    }
}

impl<H: EntityHandle, D> EntityDefs<H, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: D) -> H {
        let handle = H::from_index(self.defs.len());
        self.defs.push(def);
        handle
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &D)> + '_ {
        self.defs.iter().enumerate().map(|(i, def)| (H::from_index(i), def))
    }

    pub fn keys(&self) -> impl Iterator<Item = H> + use<H, D> {
        (0..self.defs.len()).map(H::from_index)
    }
}

impl<H: EntityHandle, D> std::ops::Index<H> for EntityDefs<H, D> {
    type Output = D;
    #[track_caller]
    fn index(&self, handle: H) -> &D {
        &self.defs[handle.index()]
    }
}

impl<H: EntityHandle, D> std::ops::IndexMut<H> for EntityDefs<H, D> {
    #[track_caller]
    fn index_mut(&mut self, handle: H) -> &mut D {
        &mut self.defs[handle.index()]
    }
}

/// Dense side-table keyed by entity handles.
///
/// Unlike a hash map, lookups are a plain vector index, and (by design) there
/// is no iteration order to depend on: iteration-sensitive pass state belongs
/// in an `FxIndexMap` instead.
#[derive(Clone)]
pub struct EntityOrientedDenseMap<H: EntityHandle, V> {
    slots: Vec<Option<V>>,
    _handle: PhantomData<H>,
}

impl<H: EntityHandle, V> Default for EntityOrientedDenseMap<H, V> {
    fn default() -> Self {
        Self { slots: vec![], _handle: PhantomData }
    }
}

impl<H: EntityHandle, V> EntityOrientedDenseMap<H, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: H, value: V) -> Option<V> {
        self.entry(handle).replace(value)
    }

    /// Grows the table as needed and returns the slot for `handle`.
    pub fn entry(&mut self, handle: H) -> &mut Option<V> {
        let index = handle.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        &mut self.slots[index]
    }

    pub fn get(&self, handle: H) -> Option<&V> {
        self.slots.get(handle.index())?.as_ref()
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut V> {
        self.slots.get_mut(handle.index())?.as_mut()
    }

    pub fn contains_key(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: H) -> Option<V> {
        self.slots.get_mut(handle.index())?.take()
    }
}

impl<H: EntityHandle, V> std::ops::Index<H> for EntityOrientedDenseMap<H, V> {
    type Output = V;
    #[track_caller]
    fn index(&self, handle: H) -> &V {
        self.get(handle).expect("no entry found for entity")
    }
}

impl<H: EntityHandle, V> std::ops::IndexMut<H> for EntityOrientedDenseMap<H, V> {
    #[track_caller]
    fn index_mut(&mut self, handle: H) -> &mut V {
        self.get_mut(handle).expect("no entry found for entity")
    }
}
