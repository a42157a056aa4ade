//! Reference-count bookkeeping for shared resources, separated from the
//! destruction policy that runs when the last reference goes away.

use std::alloc::{self, Layout};
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};

use log::{debug, trace};
use thiserror::Error;

// ---------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------

/// The bookkeeping allocation for a control block failed.
///
/// By the time a factory call returns this, the resource it was handed has
/// already been destroyed through the destruction policy that call was
/// setting up, exactly once. The caller has nothing left to clean up.
#[derive(Error, Debug)]
#[error("could not allocate a {bytes} byte control block")]
pub struct AllocError {
    bytes: usize,
}

// ---------------------------------------------------------------------
// Control blocks
// ---------------------------------------------------------------------

/// One shared resource's use count plus the policy for destroying it, type
/// erased so that handles of every pointee type store the same block
/// pointer.
///
/// A block starts with a use count of 1, held by whoever created it. The
/// count only moves through [`ControlBlock::increment`] and
/// [`ControlBlock::decrement`]; the decrement that would reach 0 instead
/// releases the resource through the block's policy and then frees the
/// block allocation itself, so a live block never shows a count of 0. The
/// resource pointer is fixed at creation and never reassigned.
///
/// Counts are plain integers. Blocks must stay on the thread that made
/// them, which the [`Shared`](crate::Shared) handle enforces by being
/// neither `Send` nor `Sync`.
#[repr(C)]
pub struct ControlBlock {
    count: usize,
    resource: *mut (),
    // Destruction policy, fixed at the factory call. `release` destroys the
    // pointee; `dealloc` frees the block allocation, which is wider than
    // `ControlBlock` for the custom deleter variant.
    release: unsafe fn(*mut ControlBlock),
    dealloc: unsafe fn(*mut ControlBlock),
}

/// Block variant that carries a caller-supplied deleter inline, after the
/// erased header. `release_deleter` consumes the deleter exactly once,
/// hence the `ManuallyDrop`; `dealloc_deleter` then only frees memory.
#[repr(C)]
struct DeleterBlock<D> {
    header: ControlBlock,
    deleter: ManuallyDrop<D>,
}

impl ControlBlock {
    fn new(
        resource: *mut (),
        release: unsafe fn(*mut ControlBlock),
        dealloc: unsafe fn(*mut ControlBlock),
    ) -> ControlBlock {
        ControlBlock { count: 1, resource, release, dealloc }
    }

    /// Wraps a pointer produced by [`Box::into_raw`] in a fresh control
    /// block whose policy is to put the pointer back into a `Box` and drop
    /// it on the final decrement.
    ///
    /// Ownership of the pointee transfers here the moment the call is made.
    /// If the block allocation fails the pointee is dropped before the
    /// error is returned, so the failure leaks nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Box::into_raw`] and nothing else may own or
    /// free it from this call on.
    pub unsafe fn alloc_boxed<T>(ptr: *mut T) -> Result<NonNull<ControlBlock>, AllocError> {
        match alloc_raw::<ControlBlock>() {
            Ok(block) => {
                unsafe {
                    block.as_ptr().write(ControlBlock::new(
                        ptr as *mut (),
                        release_boxed::<T>,
                        dealloc_plain,
                    ));
                }
                trace!("block {:p} now owns boxed resource {:p}", block, ptr);
                Ok(block)
            }
            Err(err) => {
                debug!("block allocation failed, dropping boxed resource {:p}", ptr);
                drop(unsafe { Box::from_raw(ptr) });
                Err(err)
            }
        }
    }

    /// Wraps `ptr` in a fresh control block whose policy is to hand `ptr`
    /// to `deleter` on the final decrement.
    ///
    /// The deleter runs exactly once whatever happens: if the block
    /// allocation fails it runs right here, before the error is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until `deleter` has run and nothing else may
    /// free it. The deleter must not panic, and whatever it borrows must
    /// outlive the block.
    pub unsafe fn alloc_with_deleter<T, D>(
        ptr: *mut T,
        deleter: D,
    ) -> Result<NonNull<ControlBlock>, AllocError>
    where
        D: FnOnce(*mut T),
    {
        match alloc_raw::<DeleterBlock<D>>() {
            Ok(block) => {
                unsafe {
                    block.as_ptr().write(DeleterBlock {
                        header: ControlBlock::new(
                            ptr as *mut (),
                            release_deleter::<T, D>,
                            dealloc_deleter::<D>,
                        ),
                        deleter: ManuallyDrop::new(deleter),
                    });
                }
                let block = block.cast::<ControlBlock>();
                trace!("block {:p} now owns resource {:p} with a custom deleter", block, ptr);
                Ok(block)
            }
            Err(err) => {
                debug!("block allocation failed, running deleter on resource {:p}", ptr);
                deleter(ptr);
                Err(err)
            }
        }
    }

    /// A block that owns nothing: its resource pointer is null and its
    /// release policy does nothing. Empty blocks still count references, so
    /// handles that own no resource follow the same bookkeeping path as
    /// owning ones.
    pub fn alloc_empty() -> Result<NonNull<ControlBlock>, AllocError> {
        let block = alloc_raw::<ControlBlock>()?;
        unsafe {
            block.as_ptr().write(ControlBlock::new(ptr::null_mut(), release_none, dealloc_plain));
        }
        trace!("block {:p} owns no resource", block);
        Ok(block)
    }

    /// The resource pointer `block` owns. Null only for empty blocks.
    ///
    /// # Safety
    ///
    /// `block` must point at a live control block.
    pub unsafe fn resource(block: NonNull<ControlBlock>) -> *mut () {
        unsafe { (*block.as_ptr()).resource }
    }

    /// How many handles currently share `block`. At least 1 for any live
    /// block.
    ///
    /// # Safety
    ///
    /// `block` must point at a live control block.
    pub unsafe fn use_count(block: NonNull<ControlBlock>) -> usize {
        unsafe { (*block.as_ptr()).count }
    }

    /// Records one more handle sharing `block` and returns the same pointer
    /// for that handle to store. Cannot fail.
    ///
    /// # Safety
    ///
    /// `block` must point at a live control block.
    pub unsafe fn increment(block: NonNull<ControlBlock>) -> NonNull<ControlBlock> {
        unsafe { (*block.as_ptr()).count += 1 };
        block
    }

    /// Records one handle letting go of its block. `None` is accepted and
    /// does nothing, so teardown code can hand in whatever it holds.
    ///
    /// The call that takes the count from 1 releases the resource through
    /// the block's policy and then frees the block itself; the pointer is
    /// dead afterwards. No path through here can fail.
    ///
    /// # Safety
    ///
    /// A `Some` block must point at a live control block, and the caller
    /// must be giving up exactly one reference it holds.
    pub unsafe fn decrement(block: Option<NonNull<ControlBlock>>) {
        let Some(block) = block else {
            return;
        };
        let block = block.as_ptr();
        unsafe {
            let count = (*block).count;
            if count == 1 {
                trace!("block {:p} releasing resource {:p}", block, (*block).resource);
                // Copy the policy out before it frees the block under us.
                let release = (*block).release;
                let dealloc = (*block).dealloc;
                release(block);
                dealloc(block);
            } else {
                (*block).count = count - 1;
            }
        }
    }

    /// Exchanges which blocks two handle slots point at. No count moves in
    /// either direction and nothing here can fail.
    pub fn swap(a: &mut NonNull<ControlBlock>, b: &mut NonNull<ControlBlock>) {
        mem::swap(a, b);
    }
}

// ---------------------------------------------------------------------
// Allocation and destruction policies
// ---------------------------------------------------------------------

/// Allocates one concrete block, uninitialized, reporting failure instead
/// of aborting. `B` is `ControlBlock` itself or a wider variant with the
/// header at offset zero.
fn alloc_raw<B>() -> Result<NonNull<B>, AllocError> {
    let layout = Layout::new::<B>();
    #[cfg(test)]
    {
        if alloc_failure::consume() {
            return Err(AllocError { bytes: layout.size() });
        }
    }
    // A block is never zero sized, so the layout is valid for `alloc`.
    let raw = unsafe { alloc::alloc(layout) };
    match NonNull::new(raw as *mut B) {
        Some(block) => Ok(block),
        None => Err(AllocError { bytes: layout.size() }),
    }
}

unsafe fn release_none(_block: *mut ControlBlock) {}

unsafe fn release_boxed<T>(block: *mut ControlBlock) {
    unsafe { drop(Box::from_raw((*block).resource as *mut T)) }
}

unsafe fn release_deleter<T, D: FnOnce(*mut T)>(block: *mut ControlBlock) {
    let block = block as *mut DeleterBlock<D>;
    unsafe {
        let deleter = ManuallyDrop::take(&mut (*block).deleter);
        deleter((*block).header.resource as *mut T);
    }
}

unsafe fn dealloc_plain(block: *mut ControlBlock) {
    unsafe { alloc::dealloc(block as *mut u8, Layout::new::<ControlBlock>()) }
}

unsafe fn dealloc_deleter<D>(block: *mut ControlBlock) {
    unsafe { alloc::dealloc(block as *mut u8, Layout::new::<DeleterBlock<D>>()) }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // Bumps a counter on drop so tests can see exactly when release ran.
    struct Tally<'a>(&'a Cell<u32>);

    impl Drop for Tally<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn fresh_block_counts_its_creator() {
        let raw = Box::into_raw(Box::new(17u32));
        let block = unsafe { ControlBlock::alloc_boxed(raw) }.unwrap();
        unsafe {
            assert_eq!(ControlBlock::use_count(block), 1);
            assert_eq!(ControlBlock::resource(block), raw as *mut ());
            ControlBlock::decrement(Some(block));
        }
    }

    #[test]
    fn balanced_increments_change_nothing() {
        let drops = Cell::new(0);
        let raw = Box::into_raw(Box::new(Tally(&drops)));
        let block = unsafe { ControlBlock::alloc_boxed(raw) }.unwrap();
        unsafe {
            for _ in 0..4 {
                ControlBlock::increment(block);
            }
            for _ in 0..4 {
                ControlBlock::decrement(Some(block));
            }
            assert_eq!(ControlBlock::use_count(block), 1);
            assert_eq!(ControlBlock::resource(block), raw as *mut ());
            assert_eq!(drops.get(), 0);
            ControlBlock::decrement(Some(block));
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn only_the_final_decrement_releases() {
        let drops = Cell::new(0);
        let raw = Box::into_raw(Box::new(Tally(&drops)));
        let block = unsafe { ControlBlock::alloc_boxed(raw) }.unwrap();
        unsafe {
            ControlBlock::increment(block);
            ControlBlock::decrement(Some(block));
            assert_eq!(drops.get(), 0);
            ControlBlock::decrement(Some(block));
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn empty_blocks_have_nothing_to_release() {
        let block = ControlBlock::alloc_empty().unwrap();
        unsafe {
            assert_eq!(ControlBlock::use_count(block), 1);
            assert!(ControlBlock::resource(block).is_null());
            ControlBlock::decrement(Some(block));
        }
    }

    #[test]
    fn decrement_accepts_no_block_at_all() {
        unsafe { ControlBlock::decrement(None) };
    }

    #[test]
    fn deleter_runs_once_with_the_original_pointer() {
        let raw = Box::into_raw(Box::new(5u8));
        let seen = Cell::new(std::ptr::null_mut::<u8>());
        let calls = Cell::new(0u32);
        let deleter = |p: *mut u8| {
            seen.set(p);
            calls.set(calls.get() + 1);
            drop(unsafe { Box::from_raw(p) });
        };
        let block = unsafe { ControlBlock::alloc_with_deleter(raw, deleter) }.unwrap();
        unsafe { ControlBlock::decrement(Some(block)) };
        assert_eq!(calls.get(), 1);
        assert_eq!(seen.get(), raw);
    }

    #[test]
    fn swap_exchanges_blocks_without_touching_counts() {
        let first = Box::into_raw(Box::new(1u8));
        let second = Box::into_raw(Box::new(2u8));
        let mut a = unsafe { ControlBlock::alloc_boxed(first) }.unwrap();
        let mut b = unsafe { ControlBlock::alloc_boxed(second) }.unwrap();
        unsafe { ControlBlock::increment(b) };

        ControlBlock::swap(&mut a, &mut b);

        unsafe {
            assert_eq!(ControlBlock::resource(a), second as *mut ());
            assert_eq!(ControlBlock::resource(b), first as *mut ());
            assert_eq!(ControlBlock::use_count(a), 2);
            assert_eq!(ControlBlock::use_count(b), 1);
            ControlBlock::decrement(Some(a));
            ControlBlock::decrement(Some(a));
            ControlBlock::decrement(Some(b));
        }
    }

    #[test]
    fn failed_bookkeeping_drops_the_boxed_resource() {
        let drops = Cell::new(0);
        let raw = Box::into_raw(Box::new(Tally(&drops)));
        alloc_failure::force_next(1);
        let failed = unsafe { ControlBlock::alloc_boxed(raw) };
        assert!(failed.is_err());
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn failed_bookkeeping_still_runs_the_deleter() {
        let calls = Cell::new(0u32);
        let raw = Box::into_raw(Box::new(9i64));
        let deleter = |p: *mut i64| {
            calls.set(calls.get() + 1);
            drop(unsafe { Box::from_raw(p) });
        };
        alloc_failure::force_next(1);
        let failed = unsafe { ControlBlock::alloc_with_deleter(raw, deleter) };
        assert!(failed.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn empty_allocation_can_fail_cleanly() {
        alloc_failure::force_next(1);
        assert!(ControlBlock::alloc_empty().is_err());
    }
}
