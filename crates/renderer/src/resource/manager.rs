//! Generic slot arena for one resource kind.
//!
//! Every GPU resource kind is a `(description, native objects)` pair stored
//! in a fixed-capacity [`ResourceManager`] and addressed by a [`Ref`]. The
//! kinds differ only in their [`ResourceKind`] implementation; the slot
//! bookkeeping is shared.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use tracing::trace;

use super::{ResourceContext, Resources};
use crate::error::RenderResult;

/// A resource kind: what its description and native objects look like and
/// how one turns into the other.
pub trait ResourceKind: Sized + 'static {
    /// Pure data describing the resource.
    type Desc: Default + Clone + fmt::Debug + Send + Sync;
    /// Device objects created from the description.
    type Native: Default + fmt::Debug + Send + Sync;

    /// Kind name, for logs and panics.
    const NAME: &'static str;
    /// Slots available for this kind.
    const CAPACITY: usize;

    /// Build the device objects for `desc`. `resources` is read-only so
    /// other kinds can be looked up.
    fn create_native(
        resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &Self::Desc,
    ) -> RenderResult<Self::Native>;

    /// Queue every device object of `native` for deferred release.
    fn release_native(native: Self::Native, ctx: &mut ResourceContext<'_>);

    fn manager(resources: &Resources) -> &ResourceManager<Self>;
    fn manager_mut(resources: &mut Resources) -> &mut ResourceManager<Self>;
}

/// Typed handle to a slot.
///
/// The generation makes a handle to a destroyed slot detectable even after
/// the slot has been reused.
pub struct Ref<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Ref<K> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<K> Clone for Ref<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Ref<K> {}

impl<K> PartialEq for Ref<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Ref<K> {}

impl<K> Hash for Ref<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K> PartialOrd for Ref<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Ref<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<K: ResourceKind> fmt::Debug for Ref<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", K::NAME, self.index, self.generation)
    }
}

struct Slot<K: ResourceKind> {
    generation: u32,
    active: bool,
    /// Set by `reset_to_default`; creating device objects requires it.
    described: bool,
    has_native: bool,
    name: String,
    desc: K::Desc,
    native: K::Native,
}

impl<K: ResourceKind> Slot<K> {
    fn empty() -> Self {
        Self {
            generation: 0,
            active: false,
            described: false,
            has_native: false,
            name: String::new(),
            desc: K::Desc::default(),
            native: K::Native::default(),
        }
    }
}

/// Fixed-capacity arena of one resource kind.
pub struct ResourceManager<K: ResourceKind> {
    slots: Vec<Slot<K>>,
    free: Vec<u32>,
    by_name: HashMap<String, Ref<K>>,
}

impl<K: ResourceKind> Default for ResourceManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ResourceKind> ResourceManager<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Claim a slot and give it `name`.
    ///
    /// The description starts at its default but must still be
    /// [`reset_to_default`](Self::reset_to_default) before device objects
    /// can be created from it.
    ///
    /// Names need not be unique. The most recent `create` owns the name for
    /// [`get_by_name`](Self::get_by_name); destroying that resource drops the
    /// name even if an older resource with it is still alive.
    ///
    /// # Panics
    ///
    /// Panics when every slot of the kind is in use.
    pub fn create(&mut self, name: &str) -> Ref<K> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                assert!(
                    self.slots.len() < K::CAPACITY,
                    "{} capacity of {} exhausted creating '{}'",
                    K::NAME,
                    K::CAPACITY,
                    name
                );
                self.slots.push(Slot::empty());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.active = true;
        slot.described = false;
        slot.has_native = false;
        slot.name.clear();
        slot.name.push_str(name);
        slot.desc = K::Desc::default();

        let handle = Ref::new(index, slot.generation);
        self.by_name.insert(name.to_owned(), handle);
        trace!("Created {:?} '{}'", handle, name);
        handle
    }

    /// Restore the description of `handle` to its defaults.
    pub fn reset_to_default(&mut self, handle: Ref<K>) {
        let slot = self.slot_mut(handle);
        slot.desc = K::Desc::default();
        slot.described = true;
    }

    /// Free the slot. Device objects must have been released first.
    pub fn destroy(&mut self, handle: Ref<K>) {
        let slot = self.slot_mut(handle);
        assert!(
            !slot.has_native,
            "{} '{}' destroyed while it still owns device objects",
            K::NAME,
            slot.name
        );
        slot.active = false;
        slot.described = false;
        slot.generation = slot.generation.wrapping_add(1);
        let name = std::mem::take(&mut slot.name);

        if self.by_name.get(&name) == Some(&handle) {
            self.by_name.remove(&name);
        }
        self.free.push(handle.index);
        trace!("Destroyed {:?} '{}'", handle, name);
    }

    /// Whether `handle` still names a live slot.
    pub fn is_alive(&self, handle: Ref<K>) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.active && slot.generation == handle.generation)
    }

    /// Look up a live resource by name.
    pub fn get_by_name(&self, name: &str) -> Option<Ref<K>> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, handle: Ref<K>) -> &str {
        &self.slot(handle).name
    }

    pub fn desc(&self, handle: Ref<K>) -> &K::Desc {
        &self.slot(handle).desc
    }

    pub fn desc_mut(&mut self, handle: Ref<K>) -> &mut K::Desc {
        &mut self.slot_mut(handle).desc
    }

    pub fn native(&self, handle: Ref<K>) -> &K::Native {
        &self.slot(handle).native
    }

    pub fn native_mut(&mut self, handle: Ref<K>) -> &mut K::Native {
        &mut self.slot_mut(handle).native
    }

    /// Whether device objects currently exist for `handle`.
    pub fn has_native(&self, handle: Ref<K>) -> bool {
        self.slot(handle).has_native
    }

    /// Every live handle, in slot order.
    pub fn active_refs(&self) -> impl Iterator<Item = Ref<K>> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(index, slot)| Ref::new(index as u32, slot.generation))
    }

    /// Number of live slots.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.active).count()
    }

    pub(crate) fn install_native(&mut self, handle: Ref<K>, native: K::Native) {
        let slot = self.slot_mut(handle);
        slot.native = native;
        slot.has_native = true;
    }

    pub(crate) fn take_native(&mut self, handle: Ref<K>) -> Option<K::Native> {
        let slot = self.slot_mut(handle);
        if !slot.has_native {
            return None;
        }
        slot.has_native = false;
        Some(std::mem::take(&mut slot.native))
    }

    pub(crate) fn assert_described(&self, handle: Ref<K>) {
        let slot = self.slot(handle);
        assert!(
            slot.described,
            "{} '{}' was never reset to default before creating device objects",
            K::NAME,
            slot.name
        );
    }

    fn slot(&self, handle: Ref<K>) -> &Slot<K> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.active && slot.generation == handle.generation => slot,
            _ => panic!("{handle:?} is not an active {}", K::NAME),
        }
    }

    fn slot_mut(&mut self, handle: Ref<K>) -> &mut Slot<K> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.active && slot.generation == handle.generation => slot,
            _ => panic!("{handle:?} is not an active {}", K::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::VertexLayout;

    type Layouts = ResourceManager<VertexLayout>;

    #[test]
    fn test_reused_slot_bumps_generation() {
        let mut layouts = Layouts::new();
        let a = layouts.create("a");
        layouts.destroy(a);
        let b = layouts.create("b");

        assert_eq!(a.index(), b.index());
        assert_eq!(b.generation(), a.generation() + 1);
        assert_ne!(a, b);
        assert!(!layouts.is_alive(a));
        assert!(layouts.is_alive(b));
        assert_eq!(layouts.name(b), "b");
    }

    #[test]
    #[should_panic(expected = "is not an active")]
    fn test_stale_ref_panics_on_access() {
        let mut layouts = Layouts::new();
        let a = layouts.create("a");
        layouts.destroy(a);
        let _b = layouts.create("b");
        let _ = layouts.desc(a);
    }

    #[test]
    #[should_panic(expected = "capacity of 8 exhausted")]
    fn test_capacity_exhaustion_panics() {
        let mut layouts = Layouts::new();
        for i in 0..=VertexLayout::CAPACITY {
            layouts.create(&format!("layout{i}"));
        }
    }

    #[test]
    fn test_freed_slots_are_reused_before_growing() {
        let mut layouts = Layouts::new();
        let handles: Vec<_> = (0..VertexLayout::CAPACITY)
            .map(|i| layouts.create(&format!("layout{i}")))
            .collect();
        layouts.destroy(handles[3]);
        // Full arena, but the freed slot can still be claimed.
        let again = layouts.create("again");
        assert_eq!(again.index(), 3);
    }

    #[test]
    fn test_active_refs_skip_freed_slots() {
        let mut layouts = Layouts::new();
        let a = layouts.create("a");
        let b = layouts.create("b");
        let c = layouts.create("c");
        layouts.destroy(b);

        assert_eq!(layouts.active_refs().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(layouts.active_count(), 2);
    }

    #[test]
    fn test_get_by_name_follows_reuse() {
        let mut layouts = Layouts::new();
        let old = layouts.create("mesh");
        layouts.destroy(old);
        assert_eq!(layouts.get_by_name("mesh"), None);

        let new = layouts.create("mesh");
        assert_eq!(layouts.get_by_name("mesh"), Some(new));
        assert_ne!(old, new);
    }

    #[test]
    fn test_latest_create_owns_name() {
        let mut layouts = Layouts::new();
        let first = layouts.create("shared");
        let second = layouts.create("shared");
        assert_eq!(layouts.get_by_name("shared"), Some(second));

        // Destroying the older one leaves the newer owner in place.
        layouts.destroy(first);
        assert_eq!(layouts.get_by_name("shared"), Some(second));

        layouts.destroy(second);
        assert_eq!(layouts.get_by_name("shared"), None);
    }

    #[test]
    fn test_reset_to_default_marks_described() {
        let mut layouts = Layouts::new();
        let a = layouts.create("a");
        layouts.reset_to_default(a);
        layouts.assert_described(a);
        assert!(!layouts.has_native(a));
    }

    #[test]
    #[should_panic(expected = "never reset to default")]
    fn test_undescribed_slot_is_rejected() {
        let mut layouts = Layouts::new();
        let a = layouts.create("a");
        layouts.assert_described(a);
    }
}
