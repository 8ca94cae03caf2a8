use core::{alloc::Layout, any::TypeId, fmt, mem};

use anyhow::Context;

use crate::{
    buffer::{MultiComponentBuffer, Offset},
    component::{drop_ptr, ComponentValue, DtorFn, MoveFn},
    error::Result,
    Component, ComponentInfo, Entity, Error, Id, World,
};

type DeferFn = Box<dyn FnOnce(&mut World) -> anyhow::Result<()> + Send + Sync>;

/// A recorded action to be applied to the world.
enum Command {
    Add(Entity, Id),
    Remove(Entity, Id),
    /// Set a component value, moving it out of the payload buffer
    Set {
        entity: Entity,
        id: Id,
        type_id: Option<TypeId>,
        name: &'static str,
        layout: Layout,
        dtor: Option<DtorFn>,
        move_ctor: Option<MoveFn>,
        offset: Offset,
    },
    Delete(Entity),
    DeleteRecursive(Entity, Entity),
    Clear(Entity),
    /// Copy all ids and values of the first entity to the second
    CloneInto(Entity, Entity),
    /// Execute an arbitrary function with a mutable reference to the world.
    Defer(DeferFn),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(entity, id) => f.debug_tuple("Add").field(entity).field(id).finish(),
            Self::Remove(entity, id) => f.debug_tuple("Remove").field(entity).field(id).finish(),
            Self::Set {
                entity,
                id,
                name,
                offset,
                ..
            } => f
                .debug_struct("Set")
                .field("entity", entity)
                .field("id", id)
                .field("name", name)
                .field("offset", offset)
                .finish(),
            Self::Delete(entity) => f.debug_tuple("Delete").field(entity).finish(),
            Self::DeleteRecursive(entity, relationship) => f
                .debug_tuple("DeleteRecursive")
                .field(entity)
                .field(relationship)
                .finish(),
            Self::Clear(entity) => f.debug_tuple("Clear").field(entity).finish(),
            Self::CloneInto(src, dst) => f.debug_tuple("CloneInto").field(src).field(dst).finish(),
            Self::Defer(_) => f.debug_tuple("Defer").field(&"...").finish(),
        }
    }
}

/// Records structural changes to be applied to the world at a later point.
///
/// Commands are replayed in the order they were recorded, which means the final state only
/// depends on the log and not on when it was recorded.
///
/// Replay never stops half way. Commands which refer to dead entities are skipped, and other
/// failures are reported once the whole log has been applied.
#[derive(Default)]
pub struct CommandBuffer {
    inserts: MultiComponentBuffer,
    commands: Vec<Command>,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.commands)
            .finish()
    }
}

/// Since all components are Send + Sync, the commandbuffer is as well
unsafe impl Send for CommandBuffer {}
unsafe impl Sync for CommandBuffer {}

impl CommandBuffer {
    /// Creates a new commandbuffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if no commands are recorded
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Add an id to `entity`.
    ///
    /// Data components are constructed with their constructor hook.
    pub fn add(&mut self, entity: Entity, id: impl Into<Id>) -> &mut Self {
        self.commands.push(Command::Add(entity, id.into()));
        self
    }

    /// Remove an id, which may be a wildcard pair, from `entity`
    pub fn remove(&mut self, entity: Entity, id: impl Into<Id>) -> &mut Self {
        self.commands.push(Command::Remove(entity, id.into()));
        self
    }

    /// Set a component for `entity`, adding it if necessary
    pub fn set<T: ComponentValue>(
        &mut self,
        entity: Entity,
        component: Component<T>,
        value: T,
    ) -> &mut Self {
        if mem::size_of::<T>() == 0 {
            return self.add(entity, component);
        }

        let offset = self.inserts.push(value);
        self.commands.push(Command::Set {
            entity,
            id: component.id(),
            type_id: Some(TypeId::of::<T>()),
            name: core::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            dtor: mem::needs_drop::<T>().then_some(drop_ptr::<T> as DtorFn),
            move_ctor: None,
            offset,
        });

        self
    }

    /// Set a component by copying a type erased value with the copy hook of the component.
    ///
    /// # Safety
    /// `src` must point to a valid value of the component described by `info`
    pub(crate) unsafe fn set_copy(
        &mut self,
        entity: Entity,
        id: Id,
        info: &ComponentInfo,
        src: *const u8,
    ) -> Result<&mut Self> {
        if !info.is_copyable() {
            return Err(Error::MissingCopy(id));
        }

        let offset = self.inserts.push_copy(info, src);
        self.commands.push(Command::Set {
            entity,
            id,
            type_id: info.desc.type_id,
            name: info.name(),
            layout: info.layout(),
            dtor: info.hooks().dtor,
            move_ctor: info.hooks().move_ctor,
            offset,
        });

        Ok(self)
    }

    /// Delete an entity, along with everything which cascades from it.
    ///
    /// Deleting a builtin fails with [`Error::Builtin`] when applied.
    pub fn delete(&mut self, entity: Entity) -> &mut Self {
        self.commands.push(Command::Delete(entity));
        self
    }

    /// Delete an entity and every entity which is related to it through `relationship`
    pub fn delete_recursive(&mut self, entity: Entity, relationship: Entity) -> &mut Self {
        self.commands
            .push(Command::DeleteRecursive(entity, relationship));
        self
    }

    /// Remove all ids from an entity
    pub fn clear(&mut self, entity: Entity) -> &mut Self {
        self.commands.push(Command::Clear(entity));
        self
    }

    pub(crate) fn clone_into(&mut self, src: Entity, dst: Entity) -> &mut Self {
        self.commands.push(Command::CloneInto(src, dst));
        self
    }

    /// Defer a function to execute upon the world.
    ///
    /// Errors are collected and returned from [`Self::apply`].
    pub fn defer(
        &mut self,
        func: impl FnOnce(&mut World) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.commands.push(Command::Defer(Box::new(func)));
        self
    }

    /// Moves all commands of `other` to the end of this buffer
    pub fn append(&mut self, other: &mut CommandBuffer) {
        for cmd in other.commands.drain(..) {
            let cmd = match cmd {
                Command::Set {
                    entity,
                    id,
                    type_id,
                    name,
                    layout,
                    dtor,
                    move_ctor,
                    offset,
                } => unsafe {
                    let ptr = other.inserts.take_dyn(offset);
                    let offset = self.inserts.push_raw(layout, dtor, move_ctor, ptr);
                    Command::Set {
                        entity,
                        id,
                        type_id,
                        name,
                        layout,
                        dtor,
                        move_ctor,
                        offset,
                    }
                },
                cmd => cmd,
            };

            self.commands.push(cmd);
        }

        other.inserts.clear();
    }

    /// Applies all contents of the command buffer to the world.
    /// The commandbuffer is cleared and can be reused.
    ///
    /// If the world is currently deferred the commands are moved to its main stage instead.
    pub fn apply(&mut self, world: &mut World) -> anyhow::Result<()> {
        profile_function!();
        if world.is_deferred() {
            world.main_stage().append(self);
            return Ok(());
        }

        let mut errors = Vec::new();

        for cmd in self.commands.drain(..) {
            tracing::trace!(?cmd, "replay");
            let (name, result) = match cmd {
                Command::Add(entity, id) => ("add", world.add(entity, id)),
                Command::Remove(entity, id) => ("remove", world.remove(entity, id)),
                Command::Set {
                    entity,
                    id,
                    type_id,
                    name,
                    offset,
                    ..
                } => unsafe {
                    let ptr = self.inserts.get_dyn(offset);
                    let result = world.set_dyn(entity, id, type_id, name, ptr);
                    if result.is_ok() {
                        self.inserts.take_dyn(offset);
                    }

                    ("set", result)
                },
                Command::Delete(entity) => ("delete", world.delete(entity)),
                Command::DeleteRecursive(entity, relationship) => (
                    "delete recursive",
                    world.delete_recursive(entity, relationship),
                ),
                Command::Clear(entity) => ("clear", world.clear(entity)),
                Command::CloneInto(src, dst) => ("clone", world.clone_into(src, dst)),
                Command::Defer(func) => {
                    if let Err(err) = (func)(world) {
                        tracing::warn!("Deferred function failed: {err:#}");
                        errors.push(err.context("Failed to execute deferred function"));
                    }

                    continue;
                }
            };

            match result {
                Ok(()) => {}
                Err(err) if err.is_not_alive() => {
                    tracing::debug!(%err, "Skipping {name}");
                }
                Err(err) => {
                    tracing::warn!(%err, "Failed to {name}");
                    errors.push(err.into_anyhow().context(format!("Failed to {name}")));
                }
            }
        }

        self.reset();

        let mut errors = errors.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                let rest = errors.count();
                if rest == 0 {
                    Err(first)
                } else {
                    Err(first).with_context(|| format!("and {rest} more commands failed"))
                }
            }
        }
    }

    /// Drops all recorded commands and their values but keeps allocations around.
    /// Is automatically called for [`Self::apply`].
    pub fn reset(&mut self) {
        self.inserts.clear();
        self.commands.clear();
    }
}
