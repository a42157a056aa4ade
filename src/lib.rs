//! Shared-ownership smart pointers for resources an addin keeps alive across
//! calls from its host: a reference-counted [`ControlBlock`] that separates
//! count bookkeeping from the destruction policy of the pointee, and the
//! [`Shared`] handle built on top of it.
//!
//! The destruction policy is fixed when a resource is first wrapped: undo a
//! [`Box`] allocation, run a caller-supplied deleter (a host deallocator, or
//! `|_| {}` to suppress destruction when cleanup belongs to the host), or
//! nothing at all for a handle that owns no resource yet.
//!
//! Counts are plain integers; handles and blocks stay on the thread that
//! made them, and [`Shared`] is neither `Send` nor `Sync`.

mod block;
mod shared;

pub use block::{AllocError, ControlBlock};
pub use shared::Shared;
