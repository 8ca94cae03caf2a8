use core::{
    alloc::Layout,
    any::TypeId,
    fmt::{self, Display},
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};
use std::collections::BTreeMap;

use crate::{
    error::Result,
    id::{is_wildcard_index, UNION},
    Entity, EntityIndex, Error, Id, IdTraits,
};

/// Trait alias for a 'static + Send + Sync type which can be used as a
/// component.
pub trait ComponentValue: Send + Sync + 'static {}
impl<T> ComponentValue for T where T: Send + Sync + 'static {}

/// Constructs a value in uninitialized memory
pub type CtorFn = unsafe fn(dst: *mut u8);
/// Drops a value in place
pub type DtorFn = unsafe fn(ptr: *mut u8);
/// Moves `src` into uninitialized `dst`. `src` is left logically uninitialized.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8);
/// Copies `src` into uninitialized `dst`. `src` is left untouched.
pub type CopyFn = unsafe fn(dst: *mut u8, src: *const u8);

/// Lifecycle hooks of a component.
///
/// A missing `move_ctor` or `copy_ctor` falls back to a bitwise copy. A bitwise copy is only
/// used in place of `copy_ctor` if the component has no destructor.
#[derive(Default, Clone, Copy)]
pub struct ComponentHooks {
    /// Invoked when the component is added without a value
    pub ctor: Option<CtorFn>,
    /// Invoked when the component is removed or the entity deleted
    pub dtor: Option<DtorFn>,
    /// Invoked when the entity moves between tables
    pub move_ctor: Option<MoveFn>,
    /// Invoked when a value is duplicated
    pub copy_ctor: Option<CopyFn>,
}

impl fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("move_ctor", &self.move_ctor.is_some())
            .field("copy_ctor", &self.copy_ctor.is_some())
            .finish()
    }
}

pub(crate) unsafe fn drop_ptr<T>(ptr: *mut u8) {
    ptr.cast::<T>().drop_in_place()
}

unsafe fn default_ptr<T: Default>(dst: *mut u8) {
    dst.cast::<T>().write(T::default())
}

unsafe fn clone_ptr<T: Clone>(dst: *mut u8, src: *const u8) {
    dst.cast::<T>().write((*src.cast::<T>()).clone())
}

/// Describes a component before it is registered.
#[derive(Debug, Clone, Copy)]
pub struct ComponentDesc {
    pub(crate) name: &'static str,
    pub(crate) layout: Layout,
    pub(crate) hooks: ComponentHooks,
    pub(crate) type_id: Option<TypeId>,
}

impl ComponentDesc {
    /// Describes an untyped component of the given layout
    pub fn new(name: &'static str, layout: Layout) -> Self {
        Self {
            name,
            layout,
            hooks: ComponentHooks::default(),
            type_id: None,
        }
    }

    /// Describes the Rust type `T`.
    ///
    /// A destructor is attached if `T` needs drop.
    pub fn of<T: ComponentValue>() -> Self {
        Self {
            name: core::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            hooks: ComponentHooks {
                dtor: mem::needs_drop::<T>().then_some(drop_ptr::<T> as DtorFn),
                ..Default::default()
            },
            type_id: Some(TypeId::of::<T>()),
        }
    }

    /// Sets the lifecycle hooks.
    ///
    /// # Safety
    /// The hooks must be valid for values of the described layout
    pub unsafe fn with_hooks(mut self, hooks: ComponentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Uses [`Default`] as the constructor.
    ///
    /// # Panics
    /// If the description is not of type `T`
    pub fn with_default<T: ComponentValue + Default>(mut self) -> Self {
        assert_eq!(self.type_id, Some(TypeId::of::<T>()), "Mismatched type");
        self.hooks.ctor = Some(default_ptr::<T>);
        self
    }

    /// Uses [`Clone`] to copy values.
    ///
    /// # Panics
    /// If the description is not of type `T`
    pub fn with_clone<T: ComponentValue + Clone>(mut self) -> Self {
        assert_eq!(self.type_id, Some(TypeId::of::<T>()), "Mismatched type");
        self.hooks.copy_ctor = Some(clone_ptr::<T>);
        self
    }

    /// Returns the name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the memory layout
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// Registered information about a component.
#[derive(Debug, Clone, Copy)]
pub struct ComponentInfo {
    pub(crate) id: Entity,
    pub(crate) desc: ComponentDesc,
}

impl ComponentInfo {
    /// Returns the entity the component is registered on
    pub fn id(&self) -> Entity {
        self.id
    }

    /// Returns the name of the component
    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    /// Returns the memory layout
    pub fn layout(&self) -> Layout {
        self.desc.layout
    }

    /// Returns the size of a single value
    pub fn size(&self) -> usize {
        self.desc.layout.size()
    }

    /// Returns the lifecycle hooks
    pub fn hooks(&self) -> &ComponentHooks {
        &self.desc.hooks
    }

    /// Returns true if the component occupies a column
    pub fn has_data(&self) -> bool {
        self.size() > 0
    }

    /// Returns true if the component is of the Rust type `T`
    pub fn is<T: 'static>(&self) -> bool {
        self.desc.type_id == Some(TypeId::of::<T>())
    }

    /// Returns true if values can be duplicated
    pub fn is_copyable(&self) -> bool {
        self.desc.hooks.copy_ctor.is_some() || self.desc.hooks.dtor.is_none()
    }

    pub(crate) fn dangling(&self) -> NonNull<u8> {
        // Aligned, non-null and never dereferenced
        unsafe { NonNull::new_unchecked(self.desc.layout.align() as *mut u8) }
    }

    /// # Safety
    /// `ptr` must point to a valid value of this component
    #[inline]
    pub(crate) unsafe fn drop(&self, ptr: *mut u8) {
        if let Some(dtor) = self.desc.hooks.dtor {
            dtor(ptr)
        }
    }

    /// Returns false if there is no constructor
    ///
    /// # Safety
    /// `dst` must be valid for writes of this component
    #[inline]
    pub(crate) unsafe fn construct(&self, dst: *mut u8) -> bool {
        match self.desc.hooks.ctor {
            Some(ctor) => {
                ctor(dst);
                true
            }
            None => false,
        }
    }

    /// # Safety
    /// `src` must be a valid value, `dst` valid for writes and the two must not overlap
    #[inline]
    pub(crate) unsafe fn move_to(&self, dst: *mut u8, src: *mut u8) {
        match self.desc.hooks.move_ctor {
            Some(f) => f(dst, src),
            None => ptr::copy_nonoverlapping(src, dst, self.size()),
        }
    }

    /// # Safety
    /// `src` must be a valid value, `dst` valid for writes and the two must not overlap.
    /// The component must be [copyable](Self::is_copyable)
    #[inline]
    pub(crate) unsafe fn copy_to(&self, dst: *mut u8, src: *const u8) {
        match self.desc.hooks.copy_ctor {
            Some(f) => f(dst, src),
            None => {
                debug_assert!(self.desc.hooks.dtor.is_none());
                ptr::copy_nonoverlapping(src, dst, self.size())
            }
        }
    }
}

/// A strongly typed handle to a component id.
///
/// The id is either the component entity itself, or a pair which takes its data from the
/// component.
pub struct Component<T> {
    id: Id,
    marker: PhantomData<fn() -> T>,
}

impl<T> Eq for Component<T> {}

impl<T> PartialEq for Component<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Copy for Component<T> {}

impl<T> Clone for Component<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> fmt::Debug for Component<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component").field("id", &self.id).finish()
    }
}

impl<T> Display for Component<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", tynm::type_name::<T>(), self.id)
    }
}

impl<T: ComponentValue> Component<T> {
    /// Creates a typed handle for an id.
    ///
    /// Accesses through the handle are type checked against the registered component.
    pub fn from_id(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            marker: PhantomData,
        }
    }

    /// Returns the id
    #[inline(always)]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the component entity, or the relationship index if this is a pair.
    pub fn entity(&self) -> EntityIndex {
        self.id.first()
    }

    /// Returns the pair `(self, target)`, which carries the data of this component
    pub fn of(self, target: Entity) -> Self {
        Self::from_id(Id::pair_indices(self.id.first(), target.index()))
    }

    /// Returns the pair `(relationship, self)`.
    ///
    /// The pair carries the data of this component if `relationship` is a tag.
    pub fn target_of(self, relationship: Entity) -> Self {
        Self::from_id(Id::pair_indices(relationship.index(), self.id.first()))
    }
}

impl<T> From<Component<T>> for Id {
    fn from(value: Component<T>) -> Self {
        value.id
    }
}

/// Per world storage of component information and relationship traits
#[derive(Default, Debug)]
pub(crate) struct Registry {
    infos: BTreeMap<EntityIndex, ComponentInfo>,
    traits: BTreeMap<EntityIndex, IdTraits>,
    pub(crate) types: BTreeMap<TypeId, Entity>,
}

impl Registry {
    pub fn register(&mut self, id: Entity, desc: ComponentDesc) -> Result<ComponentInfo> {
        if let Some(existing) = self.infos.get(&id.index()) {
            if existing.desc.layout != desc.layout {
                return Err(Error::InconsistentComponentInfo {
                    id: id.into(),
                    reason: "size or alignment differs from the existing registration",
                });
            }

            if existing.desc.type_id != desc.type_id {
                return Err(Error::InconsistentComponentInfo {
                    id: id.into(),
                    reason: "registered as a different type",
                });
            }

            return Ok(*existing);
        }

        if desc.layout.size() > 0 && self.traits(id.index()).contains(IdTraits::UNION) {
            return Err(Error::InconsistentComponentInfo {
                id: id.into(),
                reason: "union relationships can not carry data",
            });
        }

        let info = ComponentInfo { id, desc };
        self.infos.insert(id.index(), info);
        if let Some(type_id) = desc.type_id {
            self.types.insert(type_id, id);
        }

        Ok(info)
    }

    /// Returns the registration of the entity with the given index
    pub fn get(&self, index: EntityIndex) -> Option<&ComponentInfo> {
        self.infos.get(&index)
    }

    /// Returns the component which stores the data of an id.
    ///
    /// Tags, zero sized components, wildcards and union pairs have no data.
    pub fn data_info(&self, id: Id) -> Option<&ComponentInfo> {
        let info = match id.second() {
            None => self.infos.get(&id.first()),
            Some(second) => {
                let first = id.first();
                if is_wildcard_index(first)
                    || is_wildcard_index(second)
                    || second == UNION.index()
                    || self.traits(first).contains(IdTraits::UNION)
                {
                    return None;
                }

                self.infos
                    .get(&first)
                    .filter(|v| v.has_data())
                    .or_else(|| self.infos.get(&second))
            }
        };

        info.filter(|v| v.has_data())
    }

    pub fn traits(&self, index: EntityIndex) -> IdTraits {
        self.traits.get(&index).copied().unwrap_or_default()
    }

    pub fn set_traits(&mut self, id: Entity, traits: IdTraits) -> Result<()> {
        if traits.contains(IdTraits::UNION) && self.infos.get(&id.index()).is_some_and(|v| v.has_data())
        {
            return Err(Error::InconsistentComponentInfo {
                id: id.into(),
                reason: "union relationships can not carry data",
            });
        }

        if traits.is_empty() {
            self.traits.remove(&id.index());
        } else {
            self.traits.insert(id.index(), traits);
        }

        Ok(())
    }

    /// Forgets everything known about an entity which is being deleted
    pub fn remove(&mut self, id: Entity) {
        if let Some(info) = self.infos.remove(&id.index()) {
            if let Some(type_id) = info.desc.type_id {
                self.types.remove(&type_id);
            }
        }

        self.traits.remove(&id.index());
    }
}
