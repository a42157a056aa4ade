use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::block::{AllocError, ControlBlock};

/// A shared-ownership handle for a heap resource whose destruction policy
/// is decided once, when the resource is first wrapped.
///
/// Cloning a handle shares the same control block, one more use count;
/// dropping a handle gives that count back, and the last drop releases the
/// resource through the block's policy. Handles are single threaded: the
/// counts are plain integers and `Shared` is neither `Send` nor `Sync`.
///
/// There is no `Deref`. A handle may be [empty](Shared::empty), so the
/// resource is reached through [`Shared::as_ref`] or [`Shared::as_ptr`].
///
/// # Examples
///
/// ```
/// use xladd_shared::Shared;
///
/// let curve = Shared::new(vec![0.02f64, 0.025, 0.03]).unwrap();
/// let alias = curve.clone();
/// assert_eq!(curve.use_count(), 2);
/// assert_eq!(alias.as_ref().map(|rates| rates.len()), Some(3));
/// ```
pub struct Shared<T> {
    block: NonNull<ControlBlock>,
    _owns: PhantomData<T>,
}

impl<T> Shared<T> {
    /// Moves `value` to the heap and wraps it with the default destruction
    /// policy: the last handle to drop frees it as a [`Box`].
    ///
    /// Fails only if the bookkeeping allocation fails, and `value` is
    /// dropped before that failure is returned.
    pub fn new(value: T) -> Result<Shared<T>, AllocError> {
        // The box proves unique ownership of the pointer.
        unsafe { Shared::from_raw(Box::into_raw(Box::new(value))) }
    }

    /// Wraps an already boxed value without reallocating it.
    ///
    /// On bookkeeping failure the box is dropped, exactly once, before the
    /// error is returned.
    pub fn from_box(boxed: Box<T>) -> Result<Shared<T>, AllocError> {
        unsafe { Shared::from_raw(Box::into_raw(boxed)) }
    }

    /// Wraps a raw pointer previously produced by [`Box::into_raw`].
    ///
    /// On success the handles collectively own the pointee and the last one
    /// frees it as a [`Box`]; on bookkeeping failure it has already been
    /// freed, exactly once, when the error comes back.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Box::into_raw`], and nothing else may free it
    /// or hold `&mut` access to it while any handle lives.
    pub unsafe fn from_raw(ptr: *mut T) -> Result<Shared<T>, AllocError> {
        let block = unsafe { ControlBlock::alloc_boxed(ptr)? };
        Ok(Shared { block, _owns: PhantomData })
    }

    /// Wraps a raw pointer with a caller-supplied destruction policy:
    /// `deleter` runs exactly once, with `ptr`, when the last handle drops.
    /// A `|_| {}` deleter suppresses destruction entirely, for resources
    /// whose cleanup belongs to the host.
    ///
    /// On bookkeeping failure the deleter has already run when the error
    /// comes back, so the caller never frees `ptr` itself.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until the deleter has run and nothing else may
    /// free it. The deleter must not panic, and whatever it borrows must
    /// outlive the last handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use xladd_shared::Shared;
    ///
    /// let raw = Box::into_raw(Box::new(21u64));
    /// let deleter = |p: *mut u64| unsafe { drop(Box::from_raw(p)) };
    /// let shared = unsafe { Shared::with_deleter(raw, deleter) }.unwrap();
    /// assert_eq!(shared.as_ref(), Some(&21));
    /// ```
    pub unsafe fn with_deleter<D>(ptr: *mut T, deleter: D) -> Result<Shared<T>, AllocError>
    where
        D: FnOnce(*mut T),
    {
        let block = unsafe { ControlBlock::alloc_with_deleter(ptr, deleter)? };
        Ok(Shared { block, _owns: PhantomData })
    }

    /// A handle that owns nothing yet. It still carries a control block, so
    /// clones and drops of an empty handle follow the same bookkeeping path
    /// as owning ones.
    ///
    /// # Examples
    ///
    /// ```
    /// use xladd_shared::Shared;
    ///
    /// let pending: Shared<String> = Shared::empty().unwrap();
    /// assert!(pending.is_empty());
    /// assert_eq!(pending.as_ref(), None);
    /// assert_eq!(pending.use_count(), 1);
    /// ```
    pub fn empty() -> Result<Shared<T>, AllocError> {
        let block = ControlBlock::alloc_empty()?;
        Ok(Shared { block, _owns: PhantomData })
    }

    /// The raw resource pointer, null for an empty handle. It stays valid
    /// for as long as any handle shares the block.
    pub fn as_ptr(&self) -> *mut T {
        unsafe { ControlBlock::resource(self.block) as *mut T }
    }

    /// Borrows the resource, or `None` for an empty handle.
    pub fn as_ref(&self) -> Option<&T> {
        // Non-null means live for at least as long as `self`.
        unsafe { self.as_ptr().as_ref() }
    }

    /// How many handles currently share this resource.
    pub fn use_count(&self) -> usize {
        unsafe { ControlBlock::use_count(self.block) }
    }

    /// Whether this handle wraps no resource.
    pub fn is_empty(&self) -> bool {
        self.as_ptr().is_null()
    }

    /// Whether two handles share one control block, and so one resource.
    /// Empty handles only compare equal to their own clones.
    pub fn ptr_eq(a: &Shared<T>, b: &Shared<T>) -> bool {
        a.block == b.block
    }

    /// Exchanges the resources of two handles without touching any use
    /// count. Reassignment goes through here: build the replacement first,
    /// swap it in, and let the old resource go out with the temporary.
    ///
    /// # Examples
    ///
    /// ```
    /// use xladd_shared::Shared;
    ///
    /// let mut current = Shared::new(String::from("draft")).unwrap();
    /// let mut replacement = Shared::new(String::from("final")).unwrap();
    /// current.swap(&mut replacement);
    /// assert_eq!(current.as_ref().map(String::as_str), Some("final"));
    /// drop(replacement); // releases "draft"
    /// ```
    pub fn swap(&mut self, other: &mut Shared<T>) {
        ControlBlock::swap(&mut self.block, &mut other.block);
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Shared<T> {
        // Our own reference keeps the block live across the call.
        let block = unsafe { ControlBlock::increment(self.block) };
        Shared { block, _owns: PhantomData }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Gives up the one reference this handle holds; the block frees the
        // resource and itself when that was the last one.
        unsafe { ControlBlock::decrement(Some(self.block)) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ref() {
            Some(value) => f.debug_tuple("Shared").field(value).finish(),
            None => f.write_str("Shared(<empty>)"),
        }
    }
}
