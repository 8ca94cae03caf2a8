use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};
use std::alloc::{alloc, dealloc, handle_alloc_error};
use std::collections::BTreeMap;

use crate::component::{drop_ptr, ComponentInfo, ComponentValue, DtorFn, MoveFn};

pub(crate) type Offset = usize;

/// A type erased bump allocator
/// Does not handle dropping of the values
pub(crate) struct BufferStorage {
    data: NonNull<u8>,
    cursor: usize,
    layout: Layout,
}

impl BufferStorage {
    fn new() -> Self {
        Self {
            data: NonNull::dangling(),
            cursor: 0,
            layout: Layout::new::<()>(),
        }
    }

    /// Allocate space for a value with `layout`.
    /// Returns an offset into the internal data where a value of the compatible layout may be
    /// written.
    ///
    /// When the storage grows `relocate` is called with the new and the old block, and is
    /// responsible for moving the live values over.
    fn allocate(
        &mut self,
        item_layout: Layout,
        relocate: impl FnOnce(*mut u8, *mut u8),
    ) -> Offset {
        let align = item_layout.align();
        let offset = (self.cursor + align - 1) & !(align - 1);
        let end = offset + item_layout.size();

        if end > self.layout.size() || self.layout.align() < align {
            let new_size = end.next_power_of_two().max(64);
            let new_align = self.layout.align().max(align);

            let new_layout = match Layout::from_size_align(new_size, new_align) {
                Ok(v) => v,
                Err(_) => panic!("Buffer capacity overflow"),
            };

            // Realloc can not change the alignment, so always copy
            unsafe {
                let new_data = match NonNull::new(alloc(new_layout)) {
                    Some(v) => v,
                    None => handle_alloc_error(new_layout),
                };

                if self.layout.size() > 0 {
                    relocate(new_data.as_ptr(), self.data.as_ptr());
                    dealloc(self.data.as_ptr(), self.layout);
                }

                self.data = new_data;
            }

            self.layout = new_layout;
        }

        self.cursor = end;
        offset
    }

    pub(crate) unsafe fn at_mut(&mut self, offset: Offset) -> *mut u8 {
        self.data.as_ptr().add(offset)
    }

    /// Resets the buffer, discarding the previously held data
    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Default for BufferStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { dealloc(self.data.as_ptr(), self.layout) }
        }
    }
}

/// A value owned by the buffer
#[derive(Clone, Copy)]
struct Slot {
    size: usize,
    dtor: Option<DtorFn>,
    move_ctor: Option<MoveFn>,
}

/// Stores values of differing types until they are taken.
///
/// Values which are never taken are dropped when the buffer is cleared.
#[derive(Default)]
pub(crate) struct MultiComponentBuffer {
    storage: BufferStorage,
    slots: BTreeMap<Offset, Slot>,
}

impl MultiComponentBuffer {
    fn allocate(&mut self, layout: Layout, slot: Slot) -> Offset {
        let slots = &self.slots;
        let offset = self.storage.allocate(layout, |dst, src| unsafe {
            for (&offset, slot) in slots {
                match slot.move_ctor {
                    Some(f) => f(dst.add(offset), src.add(offset)),
                    None => ptr::copy_nonoverlapping(src.add(offset), dst.add(offset), slot.size),
                }
            }
        });

        let old = self.slots.insert(offset, slot);
        assert!(old.is_none());
        offset
    }

    /// Push a new value into the buffer
    pub fn push<T: ComponentValue>(&mut self, value: T) -> Offset {
        let offset = self.allocate(
            Layout::new::<T>(),
            Slot {
                size: mem::size_of::<T>(),
                dtor: mem::needs_drop::<T>().then_some(drop_ptr::<T> as DtorFn),
                move_ctor: None,
            },
        );

        unsafe { self.storage.at_mut(offset).cast::<T>().write(value) }
        offset
    }

    /// Copies a type erased value into the buffer using the copy hook of the component.
    ///
    /// # Safety
    /// `src` must point to a valid value of the component, which must be copyable
    pub unsafe fn push_copy(&mut self, info: &ComponentInfo, src: *const u8) -> Offset {
        let offset = self.allocate(
            info.layout(),
            Slot {
                size: info.size(),
                dtor: info.hooks().dtor,
                move_ctor: info.hooks().move_ctor,
            },
        );

        info.copy_to(self.storage.at_mut(offset), src);
        offset
    }

    /// Moves a type erased value into the buffer.
    ///
    /// # Safety
    /// `src` must point to a valid value of `layout`, movable with `move_ctor` or bitwise if
    /// there is none. The value is logically moved out of `src`.
    pub unsafe fn push_raw(
        &mut self,
        layout: Layout,
        dtor: Option<DtorFn>,
        move_ctor: Option<MoveFn>,
        src: *mut u8,
    ) -> Offset {
        let offset = self.allocate(
            layout,
            Slot {
                size: layout.size(),
                dtor,
                move_ctor,
            },
        );

        let dst = self.storage.at_mut(offset);
        match move_ctor {
            Some(f) => f(dst, src),
            None => ptr::copy_nonoverlapping(src, dst, layout.size()),
        }

        offset
    }

    /// Returns a pointer to a value which is still owned by the buffer.
    ///
    /// # Safety
    /// The pointer is invalidated by the next push
    pub unsafe fn get_dyn(&mut self, offset: Offset) -> *mut u8 {
        debug_assert!(self.slots.contains_key(&offset), "Value already taken");
        self.storage.at_mut(offset)
    }

    /// Takes ownership of the value at `offset`.
    ///
    /// # Safety
    /// The value must not be taken twice. The pointer is invalidated by the next push.
    pub unsafe fn take_dyn(&mut self, offset: Offset) -> *mut u8 {
        let old = self.slots.remove(&offset);
        debug_assert!(old.is_some(), "Value taken twice");
        self.storage.at_mut(offset)
    }

    pub fn clear(&mut self) {
        for (&offset, slot) in &self.slots {
            if let Some(drop) = slot.dtor {
                unsafe {
                    let ptr = self.storage.at_mut(offset);
                    (drop)(ptr)
                }
            }
        }

        self.slots.clear();
        self.storage.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for MultiComponentBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

unsafe impl Send for MultiComponentBuffer {}
unsafe impl Sync for MultiComponentBuffer {}
