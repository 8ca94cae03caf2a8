use core::fmt;

use atomic_refcell::{AtomicRef, AtomicRefMut};

use crate::{
    component::ComponentValue, error::Result, CommandBuffer, Component, Entity, Error, Id, World,
};

/// Whether structural changes are applied immediately or recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeferState {
    /// Changes are applied as they are made
    #[default]
    Live,
    /// Changes are recorded into the main stage. The value is the number of nested scopes.
    Deferred(usize),
}

/// A handle which records structural changes into one of the world's command buffers.
///
/// Stages only need a shared reference to the world, which allows several threads to record
/// changes while the world is read only, as long as every thread uses its own stage.
///
/// Recorded changes are applied by [`World::merge`] or [`World::readonly_end`], in stage index
/// order.
#[derive(Clone, Copy)]
pub struct Stage<'w> {
    pub(crate) world: &'w World,
    pub(crate) index: usize,
}

impl fmt::Debug for Stage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("index", &self.index).finish()
    }
}

impl<'w> Stage<'w> {
    /// Returns the index of the stage
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the world the stage records into
    pub fn world(&self) -> &'w World {
        self.world
    }

    /// Provides access to the command buffer of the stage.
    ///
    /// # Panics
    /// If the stage is used from two threads at once
    pub fn commands(&self) -> AtomicRefMut<'w, CommandBuffer> {
        match self.world.stages[self.index].try_borrow_mut() {
            Ok(v) => v,
            Err(_) => panic!("Stage {} is used concurrently", self.index),
        }
    }

    /// Creates a new entity.
    ///
    /// The handle is unique immediately, but the entity only becomes alive when the stage is
    /// merged.
    pub fn create(&self) -> Entity {
        self.world.entities.reserve_one()
    }

    /// Records adding `id` to `entity`
    pub fn add(&self, entity: Entity, id: impl Into<Id>) -> &Self {
        self.commands().add(entity, id);
        self
    }

    /// Records removing `id` from `entity`
    pub fn remove(&self, entity: Entity, id: impl Into<Id>) -> &Self {
        self.commands().remove(entity, id);
        self
    }

    /// Records setting a component value.
    ///
    /// Fails immediately if the component is registered for another type.
    pub fn set<T: ComponentValue>(
        &self,
        entity: Entity,
        component: Component<T>,
        value: T,
    ) -> Result<&Self> {
        self.world.check_type::<T>(entity, component.id())?;
        self.commands().set(entity, component, value);
        Ok(self)
    }

    /// Records setting a component by copying it from `src` with the copy hook.
    ///
    /// # Safety
    /// `src` must point to a valid value of the component which stores the data of `id`
    pub unsafe fn set_ptr(&self, entity: Entity, id: impl Into<Id>, src: *const u8) -> Result<&Self> {
        let id = id.into();
        let info = *self
            .world
            .component_info(id)
            .ok_or(Error::MissingComponent(entity, id))?;

        self.commands().set_copy(entity, id, &info, src)?;
        Ok(self)
    }

    /// Records deleting `entity`.
    ///
    /// Deleting a builtin is reported as a failure when the stage is merged.
    pub fn delete(&self, entity: Entity) -> &Self {
        self.commands().delete(entity);
        self
    }

    /// Records deleting `entity` and everything related to it through `relationship`
    pub fn delete_recursive(&self, entity: Entity, relationship: Entity) -> &Self {
        self.commands().delete_recursive(entity, relationship);
        self
    }

    /// Records removing every id from `entity`
    pub fn clear(&self, entity: Entity) -> &Self {
        self.commands().clear(entity);
        self
    }

    /// Records a function to run with exclusive access to the world
    pub fn defer(
        &self,
        func: impl FnOnce(&mut World) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &Self {
        self.commands().defer(func);
        self
    }

    /// Reads the current value of a component, ignoring changes recorded into any stage
    pub fn get<T: ComponentValue>(
        &self,
        entity: Entity,
        component: Component<T>,
    ) -> Result<AtomicRef<'w, T>> {
        self.world.get(entity, component)
    }

    /// Returns true if the entity currently has `id`
    pub fn has(&self, entity: Entity, id: impl Into<Id>) -> bool {
        self.world.has(entity, id)
    }

    /// Returns true if the entity is alive
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.world.is_alive(entity)
    }
}
