use core::{alloc::Layout, ptr::NonNull, slice};
use std::alloc::{alloc, dealloc, handle_alloc_error, realloc};

use crate::ComponentInfo;

/// Type erased, growable storage of a single component
pub(crate) struct Column {
    data: NonNull<u8>,
    len: usize,
    cap: usize,
    info: ComponentInfo,
}

/// Since all components are Send + Sync, the column is as well
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl core::fmt::Debug for Column {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.info.name())
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

impl Column {
    pub(crate) fn new(info: ComponentInfo) -> Self {
        debug_assert!(info.has_data());
        Self {
            data: info.dangling(),
            len: 0,
            cap: 0,
            info,
        }
    }

    #[inline(always)]
    pub(crate) fn info(&self) -> &ComponentInfo {
        &self.info
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    fn layout_of(&self, cap: usize) -> Layout {
        match Layout::from_size_align(self.info.size() * cap, self.info.layout().align()) {
            Ok(v) => v,
            Err(_) => panic!("Capacity overflow for {}", self.info.name()),
        }
    }

    /// Ensures there is room for at least `additional` more values
    pub(crate) fn reserve(&mut self, additional: usize) {
        let required = self.len + additional;
        if required <= self.cap {
            return;
        }

        let new_cap = required.next_power_of_two().max(4);
        let new_layout = self.layout_of(new_cap);

        let old_layout = self.layout_of(self.cap);
        let relocate = self.cap > 0 && self.info.hooks().move_ctor.is_some();

        let ptr = unsafe {
            if self.cap == 0 || relocate {
                alloc(new_layout)
            } else {
                realloc(self.data.as_ptr(), old_layout, new_layout.size())
            }
        };

        let data = match NonNull::new(ptr) {
            Some(v) => v,
            None => handle_alloc_error(new_layout),
        };

        // Values with a move hook may not be moved bitwise
        if relocate {
            let size = self.info.size();
            unsafe {
                for row in 0..self.len {
                    self.info
                        .move_to(data.as_ptr().add(size * row), self.at(row));
                }

                dealloc(self.data.as_ptr(), old_layout);
            }
        }

        self.data = data;
        self.cap = new_cap;
    }

    /// Appends an uninitialized value and returns a pointer to it.
    ///
    /// # Safety
    /// The returned pointer must be written to before the column is read or dropped
    pub(crate) unsafe fn push_uninit(&mut self) -> *mut u8 {
        self.reserve(1);
        let ptr = self.at(self.len);
        self.len += 1;
        ptr
    }

    #[inline(always)]
    pub(crate) unsafe fn at(&self, row: usize) -> *mut u8 {
        self.data.as_ptr().add(self.info.size() * row)
    }

    /// Removes the value at `row` by moving the last value into its place.
    ///
    /// If `dst` is given the removed value is moved into it, otherwise it is dropped.
    ///
    /// # Safety
    /// `row` must be in bounds and `dst` valid for writes
    pub(crate) unsafe fn swap_remove(&mut self, row: usize, dst: Option<*mut u8>) {
        debug_assert!(row < self.len);
        let ptr = self.at(row);

        match dst {
            Some(dst) => self.info.move_to(dst, ptr),
            None => self.info.drop(ptr),
        }

        let last = self.len - 1;
        if row != last {
            self.info.move_to(ptr, self.at(last));
        }

        self.len = last;
    }

    /// # Safety
    /// The column must store values of type `T`
    pub(crate) unsafe fn as_slice<T>(&self) -> &[T] {
        slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len)
    }

    /// # Safety
    /// The column must store values of type `T`
    pub(crate) unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        slice::from_raw_parts_mut(self.data.as_ptr().cast::<T>(), self.len)
    }

    pub(crate) fn clear(&mut self) {
        for row in 0..self.len {
            unsafe { self.info.drop(self.at(row)) }
        }

        self.len = 0;
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();

        if self.cap > 0 {
            unsafe { dealloc(self.data.as_ptr(), self.layout_of(self.cap)) }
        }
    }
}
