//! A generational, mostly-precise garbage collector core for managed-language
//! runtimes.
//!
//! `kestrel-gc` manages a heap of typed objects on behalf of a language
//! runtime. New objects are bump-allocated in a **nursery** through
//! per-thread allocation buffers; survivors are **copied** into a major heap
//! made of fixed-size sections. Large objects get their own mappings and
//! never move. Stacks and registers are scanned **conservatively**: any
//! object they appear to reference is pinned in place for that collection.
//!
//! # Features
//!
//! - **Copying minor collections** driven by remembered sets filled by write
//!   barriers
//! - **Major collections** that evacuate sections and sweep large and pinned
//!   objects
//! - **Finalizers and disappearing links**, registered through lock-free
//!   staging arrays
//! - **Cooperative stop-the-world** at safepoints, with native-code regions
//! - **Memory governor** deciding when a minor collection escalates
//!
//! # Quick Start
//!
//! ```
//! use kestrel_gc::{Collector, GcConfig, Generation, ObjectType, RootDescriptor};
//!
//! let collector = Collector::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
//! let mutator = collector.register_thread();
//!
//! // A 32-byte object whose words 2 and 3 hold references.
//! let node = ObjectType::object("Node", 32, &[2, 3]);
//!
//! let mut roots = [0usize; 1];
//! unsafe { collector.register_root(roots.as_mut_ptr(), 1, RootDescriptor::all_refs(1)) };
//!
//! let head = mutator.alloc(node).unwrap();
//! let tail = mutator.alloc(node).unwrap();
//! unsafe {
//!     mutator.set_ref(head, 2, Some(tail));
//!     mutator.write_barrier(&mut roots[0], Some(head));
//! }
//!
//! mutator.collect(Generation::Nursery);
//!
//! // `head` was promoted; the root slot was updated to its new address.
//! let head = kestrel_gc::ObjRef::from_addr(roots[0]).unwrap();
//! assert!(!collector.is_young(head));
//! assert!(unsafe { head.read_ref(2) }.is_some());
//! # collector.unregister_root(roots.as_mut_ptr());
//! ```
//!
//! # Threads
//!
//! Every thread that touches the heap registers itself with
//! [`Collector::register_thread`] and polls [`Mutator::safepoint`] regularly
//! (allocation does so implicitly). Threads that run native code for a long
//! time bracket it with [`Mutator::enter_native`] / [`Mutator::leave_native`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod barrier;
mod collector;
mod config;
mod descriptor;
mod error;
mod finalize;
mod gc;
mod governor;
mod heap;
mod internal;
mod mutator;
mod object;
mod remset;
mod roots;
mod scan;
mod stack;
mod thread;

pub mod metrics;
pub mod staging;
pub mod tracing;

// Re-export public API
pub use collector::{Collector, Generation, NoopRuntime, Runtime};
pub use config::{
    GcConfig, DEFAULT_NURSERY_SIZE, DEFAULT_TLAB_SIZE, MIN_NURSERY_SIZE, MIN_TLAB_SIZE,
};
pub use descriptor::{
    bitmap_from_words, Descriptor, DescriptorKind, RootDescriptor, UserMarkFn, VectorSubtype,
    MAX_ELEMENT_SIZE, MAX_ENCODED_SIZE,
};
pub use error::{GcError, GcResult};
pub use heap::major::SECTION_SIZE;
pub use heap::pinned::MAX_PINNED_OBJECT_SIZE;
pub use heap::{FRAGMENT_MIN_SIZE, MAX_SMALL_OBJ_SIZE, SCAN_START_SIZE};
pub use internal::{InternalAlloc, InternalMemType};
pub use metrics::{CollectionType, GcMetrics};
pub use mutator::Mutator;
pub use object::{align_up, ObjRef, ObjectState, ObjectType, HEADER_SIZE};
pub use remset::STORE_BUFFER_SIZE;
pub use scan::scan_region_conservatively;
pub use stack::{get_stack_bounds, StackBounds};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    /// Clear CPU registers to prevent stale pointer values from being treated as roots.
    ///
    /// # Safety
    ///
    /// This function clears callee-saved registers. It should only be called
    /// when those registers don't contain values needed by the calling code.
    pub unsafe fn clear_registers() {
        // SAFETY: forwarded to the caller.
        unsafe { crate::stack::clear_registers() };
    }
}
