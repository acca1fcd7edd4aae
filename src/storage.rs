//! Storage policies: how to hold an allocator. Owning it is trivial
//! ([`AllocatorAdapter`]); the interesting cases are sharing one stateful
//! allocator between several handles ([`AllocatorRef`], through a lock),
//! conjuring stateless allocators out of thin air ([`StatelessRef`], a
//! zero-sized handle) and erasing the concrete type altogether
//! ([`AnyAllocatorRef`]).
//!
//! Every storage type implements [`RawAllocator`] itself, so wrappers
//! nest and anything generic over allocators takes them unchanged.

use std::cell::{RefCell, RefMut};
use std::marker::PhantomData;
use std::ops::DerefMut;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{AllocationError, AllocatorInfo};
use crate::traits::{RawAllocator, StatelessAllocator};

/// Mutual exclusion around a shared allocator. [`Mutex`] is the
/// thread-safe implementation; [`NoLock`] serves single-threaded code
/// without atomics and refuses to cross threads instead of locking.
pub trait Lock {
    type Target;
    type Guard<'a>: DerefMut<Target = Self::Target>
    where
        Self: 'a;

    fn new(value: Self::Target) -> Self;

    /// Acquires the lock until the guard drops. Batching several
    /// operations under one guard saves re-locking.
    fn lock(&self) -> Self::Guard<'_>;

    fn into_inner(self) -> Self::Target;
}

impl<T> Lock for Mutex<T> {
    type Target = T;
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Mutex::new(value)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A panic mid-allocation cannot leave the allocator in a state
        // worse than any other caller-visible one, so poisoning is
        // ignored rather than propagated.
        Mutex::lock(self).unwrap_or_else(PoisonError::into_inner)
    }

    fn into_inner(self) -> T {
        Mutex::into_inner(self).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-threaded stand-in for a mutex: borrow-checked at runtime, no
/// atomics, `!Sync` so misuse does not compile.
pub struct NoLock<T>(RefCell<T>);

impl<T> Lock for NoLock<T> {
    type Target = T;
    type Guard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        NoLock(RefCell::new(value))
    }

    fn lock(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

/// The lock shared references use when none is named explicitly.
#[cfg(feature = "thread-safe-reference")]
pub type DefaultLock<T> = Mutex<T>;

/// The lock shared references use when none is named explicitly.
#[cfg(not(feature = "thread-safe-reference"))]
pub type DefaultLock<T> = NoLock<T>;

/// Direct storage: embeds an allocator by value. Moving the adapter
/// moves the allocator; nothing else is added. Mostly useful to give a
/// minimal allocator the full interface or to nest inside other
/// wrappers.
pub struct AllocatorAdapter<A: RawAllocator> {
    allocator: A,
}

impl<A: RawAllocator> AllocatorAdapter<A> {
    pub fn new(allocator: A) -> Self {
        Self { allocator }
    }

    pub fn get_allocator(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn into_inner(self) -> A {
        self.allocator
    }
}

impl<A: RawAllocator + Default> Default for AllocatorAdapter<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: RawAllocator> RawAllocator for AllocatorAdapter<A> {
    const IS_STATEFUL: bool = A::IS_STATEFUL;
    const IS_ARRAY_AWARE: bool = A::IS_ARRAY_AWARE;
    const IS_COMPOSABLE: bool = A::IS_COMPOSABLE;

    fn info(&self) -> AllocatorInfo {
        self.allocator.info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.allocator.allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.allocator.deallocate_node(ptr, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.allocator.allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        self.allocator.deallocate_array(ptr, count, size, alignment)
    }

    fn max_node_size(&self) -> usize {
        self.allocator.max_node_size()
    }

    fn max_array_size(&self) -> usize {
        self.allocator.max_array_size()
    }

    fn max_alignment(&self) -> usize {
        self.allocator.max_alignment()
    }
}

/// Reference storage for stateful allocators: a `Copy` handle to a
/// caller-owned, lock-wrapped allocator. Every operation runs inside the
/// lock; [`lock`](Self::lock) exposes the guard for batched work. The
/// caller keeps the lock (and the allocator in it) alive for `'a`.
pub struct AllocatorRef<'a, L: Lock> {
    lock: &'a L,
}

impl<L: Lock> Clone for AllocatorRef<'_, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: Lock> Copy for AllocatorRef<'_, L> {}

impl<'a, L: Lock> AllocatorRef<'a, L>
where
    L::Target: RawAllocator,
{
    pub fn new(lock: &'a L) -> Self {
        Self { lock }
    }

    /// Access to the referenced allocator. There is no way to reach it
    /// without holding the lock, so this returns the same guard as
    /// [`lock`](Self::lock).
    pub fn get_allocator(&self) -> L::Guard<'a> {
        self.lock.lock()
    }

    /// Holds the lock until the guard drops, for several operations
    /// without re-locking.
    pub fn lock(&self) -> L::Guard<'a> {
        self.lock.lock()
    }
}

impl<L: Lock> RawAllocator for AllocatorRef<'_, L>
where
    L::Target: RawAllocator,
{
    const IS_ARRAY_AWARE: bool = <L::Target>::IS_ARRAY_AWARE;
    const IS_COMPOSABLE: bool = <L::Target>::IS_COMPOSABLE;

    fn info(&self) -> AllocatorInfo {
        self.lock.lock().info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.lock.lock().allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.lock.lock().deallocate_node(ptr, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.lock.lock().allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        self.lock.lock().deallocate_array(ptr, count, size, alignment)
    }

    fn max_node_size(&self) -> usize {
        self.lock.lock().max_node_size()
    }

    fn max_array_size(&self) -> usize {
        self.lock.lock().max_array_size()
    }

    fn max_alignment(&self) -> usize {
        self.lock.lock().max_alignment()
    }
}

/// Reference storage for stateless allocators: stores nothing at all and
/// materializes a fresh instance per operation. Zero-sized, `Copy`, no
/// lock, because there is no shared state to protect.
pub struct StatelessRef<A: StatelessAllocator> {
    marker: PhantomData<A>,
}

impl<A: StatelessAllocator> StatelessRef<A> {
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }

    /// A throwaway instance of the underlying allocator.
    pub fn get_allocator(&self) -> A {
        A::default()
    }
}

impl<A: StatelessAllocator> Default for StatelessRef<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: StatelessAllocator> Clone for StatelessRef<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: StatelessAllocator> Copy for StatelessRef<A> {}

impl<A: StatelessAllocator> RawAllocator for StatelessRef<A> {
    const IS_STATEFUL: bool = false;
    const IS_ARRAY_AWARE: bool = A::IS_ARRAY_AWARE;
    const IS_COMPOSABLE: bool = A::IS_COMPOSABLE;

    fn info(&self) -> AllocatorInfo {
        A::default().info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        A::default().allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        A::default().deallocate_node(ptr, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        A::default().allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        A::default().deallocate_array(ptr, count, size, alignment)
    }

    fn max_node_size(&self) -> usize {
        A::default().max_node_size()
    }

    fn max_array_size(&self) -> usize {
        A::default().max_array_size()
    }

    fn max_alignment(&self) -> usize {
        A::default().max_alignment()
    }
}

impl<A: StatelessAllocator> StatelessAllocator for StatelessRef<A> {}

/// Query selector for the type-erased maxima, one vtable slot instead of
/// three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    NodeSize,
    ArraySize,
    Alignment,
}

/// Object-safe mirror of [`RawAllocator`] for type erasure. A count of 1
/// means a node operation. Implemented by the lock types over a raw
/// allocator and by [`StatelessRef`], so both stateful and stateless
/// allocators erase to the same shape.
pub trait DynAllocator {
    fn dyn_info(&self) -> AllocatorInfo;

    fn dyn_allocate(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError>;

    /// # Safety
    ///
    /// Same contract as [`RawAllocator::deallocate_node`] /
    /// [`RawAllocator::deallocate_array`].
    unsafe fn dyn_deallocate(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize);

    fn dyn_max(&self, query: Query) -> usize;
}

fn locked_allocate<L: Lock>(
    lock: &L,
    count: usize,
    size: usize,
    alignment: usize,
) -> Result<NonNull<u8>, AllocationError>
where
    L::Target: RawAllocator,
{
    let mut allocator = lock.lock();
    if count == 1 {
        allocator.allocate_node(size, alignment)
    } else {
        allocator.allocate_array(count, size, alignment)
    }
}

unsafe fn locked_deallocate<L: Lock>(
    lock: &L,
    ptr: NonNull<u8>,
    count: usize,
    size: usize,
    alignment: usize,
) where
    L::Target: RawAllocator,
{
    let mut allocator = lock.lock();
    if count == 1 {
        allocator.deallocate_node(ptr, size, alignment)
    } else {
        allocator.deallocate_array(ptr, count, size, alignment)
    }
}

fn locked_max<L: Lock>(lock: &L, query: Query) -> usize
where
    L::Target: RawAllocator,
{
    let allocator = lock.lock();
    match query {
        Query::NodeSize => allocator.max_node_size(),
        Query::ArraySize => allocator.max_array_size(),
        Query::Alignment => allocator.max_alignment(),
    }
}

/// Implements [`DynAllocator`] for a lock type. A blanket impl over
/// every [`Lock`] would conflict with the [`StatelessRef`] impl below,
/// so the two lock types are spelled out.
macro_rules! dyn_allocator_via_lock {
    ($lock:ident) => {
        impl<T: RawAllocator> DynAllocator for $lock<T> {
            fn dyn_info(&self) -> AllocatorInfo {
                Lock::lock(self).info()
            }

            fn dyn_allocate(
                &self,
                count: usize,
                size: usize,
                alignment: usize,
            ) -> Result<NonNull<u8>, AllocationError> {
                locked_allocate(self, count, size, alignment)
            }

            unsafe fn dyn_deallocate(
                &self,
                ptr: NonNull<u8>,
                count: usize,
                size: usize,
                alignment: usize,
            ) {
                locked_deallocate(self, ptr, count, size, alignment)
            }

            fn dyn_max(&self, query: Query) -> usize {
                locked_max(self, query)
            }
        }
    };
}

dyn_allocator_via_lock!(Mutex);
dyn_allocator_via_lock!(NoLock);

impl<A: StatelessAllocator> DynAllocator for StatelessRef<A> {
    fn dyn_info(&self) -> AllocatorInfo {
        A::default().info()
    }

    fn dyn_allocate(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        let mut allocator = A::default();
        if count == 1 {
            allocator.allocate_node(size, alignment)
        } else {
            allocator.allocate_array(count, size, alignment)
        }
    }

    unsafe fn dyn_deallocate(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        let mut allocator = A::default();
        if count == 1 {
            allocator.deallocate_node(ptr, size, alignment)
        } else {
            allocator.deallocate_array(ptr, count, size, alignment)
        }
    }

    fn dyn_max(&self, query: Query) -> usize {
        let allocator = A::default();
        match query {
            Query::NodeSize => allocator.max_node_size(),
            Query::ArraySize => allocator.max_array_size(),
            Query::Alignment => allocator.max_alignment(),
        }
    }
}

/// Type-erased allocator reference: any lock-wrapped allocator (or
/// stateless handle) behind one concrete type. Two words, `Copy`,
/// non-owning; the caller keeps the referent alive for `'a`.
pub struct AnyAllocatorRef<'a> {
    allocator: &'a (dyn DynAllocator + 'a),
}

impl<'a> AnyAllocatorRef<'a> {
    pub fn new(allocator: &'a (dyn DynAllocator + 'a)) -> Self {
        Self { allocator }
    }

    /// The erased allocator. The concrete type is gone; what remains is
    /// the full raw-allocator operation set of [`DynAllocator`].
    pub fn get_allocator(&self) -> &'a (dyn DynAllocator + 'a) {
        self.allocator
    }
}

impl Clone for AnyAllocatorRef<'_> {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for AnyAllocatorRef<'_> {}

// Erasure drops the compile-time capability set along with the type;
// the consts keep their trait defaults and the caller answers for the
// erased allocator's actual contract.
impl RawAllocator for AnyAllocatorRef<'_> {
    fn info(&self) -> AllocatorInfo {
        self.allocator.dyn_info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.allocator.dyn_allocate(1, size, alignment)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.allocator.dyn_deallocate(ptr, 1, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        self.allocator.dyn_allocate(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        self.allocator.dyn_deallocate(ptr, count, size, alignment)
    }

    fn max_node_size(&self) -> usize {
        self.allocator.dyn_max(Query::NodeSize)
    }

    fn max_array_size(&self) -> usize {
        self.allocator.dyn_max(Query::ArraySize)
    }

    fn max_alignment(&self) -> usize {
        self.allocator.dyn_max(Query::Alignment)
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::heap::Heap;
    use crate::pool::NodePool;

    #[test]
    fn adapter_owns_and_forwards() {
        let pool: NodePool = NodePool::new(16, 512);
        let mut adapter = AllocatorAdapter::new(pool);

        let node = adapter.allocate_node(16, 8).unwrap();
        unsafe { adapter.deallocate_node(node, 16, 8) };
        assert_eq!(adapter.max_node_size(), 16);

        // Moving the adapter moves the pool; the node we freed is still
        // cached inside.
        let mut pool = adapter.into_inner();
        assert_eq!(pool.allocate().unwrap(), node);
    }

    #[test]
    fn reference_shares_one_pool() {
        let pool: NodePool = NodePool::new(32, 1024);
        let lock = Mutex::new(pool);

        let mut first = AllocatorRef::new(&lock);
        let mut second = first;

        let a = first.allocate_node(32, 8).unwrap();
        let b = second.allocate_node(32, 8).unwrap();
        assert_ne!(a, b);

        // Memory from one handle can go back through the other, it is
        // the same allocator.
        unsafe {
            second.deallocate_node(a, 32, 8);
            first.deallocate_node(b, 32, 8);
        }
    }

    #[test]
    fn batched_operations_under_one_guard() {
        let pool: NodePool = NodePool::new(16, 512);
        let lock = Mutex::new(pool);
        let reference = AllocatorRef::new(&lock);

        let mut guard = reference.lock();
        let nodes: Vec<_> = (0..8).map(|_| guard.allocate().unwrap()).collect();
        for node in nodes.into_iter().rev() {
            unsafe { guard.deallocate(node) };
        }
        drop(guard);

        // The accessor reaches the same allocator, locked.
        assert_eq!(reference.get_allocator().node_size(), 16);
    }

    #[test]
    fn wrappers_report_the_inner_capabilities() {
        use crate::pool::SmallNodePool;
        use crate::stack::MemoryStack;

        assert!(NodePool::<Heap>::IS_ARRAY_AWARE);
        assert!(!SmallNodePool::<Heap>::IS_ARRAY_AWARE);
        assert!(!MemoryStack::<Heap>::IS_COMPOSABLE);

        assert!(AllocatorAdapter::<NodePool>::IS_ARRAY_AWARE);
        assert!(AllocatorAdapter::<NodePool>::IS_COMPOSABLE);
        assert!(!AllocatorAdapter::<MemoryStack>::IS_COMPOSABLE);
        assert!(AllocatorRef::<'static, Mutex<NodePool>>::IS_ARRAY_AWARE);
        assert!(!StatelessRef::<Heap>::IS_STATEFUL);
        assert!(!StatelessRef::<Heap>::IS_ARRAY_AWARE);
        assert!(StatelessRef::<Heap>::IS_COMPOSABLE);
    }

    #[test]
    fn threads_share_a_pool_through_references() {
        let pool: NodePool = NodePool::new(64, 4096);
        let lock = Mutex::new(pool);
        let threads = 4;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    let mut reference = AllocatorRef::new(&lock);
                    barrier.wait();
                    for round in 0..100u8 {
                        let node = reference.allocate_node(64, 8).unwrap();
                        unsafe {
                            node.as_ptr().write_bytes(round, 64);
                            // Nobody else may have gotten this cell.
                            assert_eq!(*node.as_ptr().add(63), round);
                            reference.deallocate_node(node, 64, 8);
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn no_lock_works_single_threaded() {
        let pool: NodePool = NodePool::new(16, 512);
        let lock: NoLock<_> = NoLock::new(pool);
        let mut reference = AllocatorRef::new(&lock);

        let node = reference.allocate_node(16, 8).unwrap();
        unsafe { reference.deallocate_node(node, 16, 8) };
    }

    #[test]
    fn stateless_ref_is_zero_sized() {
        assert_eq!(mem::size_of::<StatelessRef<Heap>>(), 0);

        let mut reference = StatelessRef::<Heap>::new();
        let node = reference.allocate_node(64, 8).unwrap();
        // Any other handle may free it, there is no state.
        let mut other = StatelessRef::<Heap>::new();
        unsafe { other.deallocate_node(node, 64, 8) };
    }

    #[test]
    fn erased_reference_round_trips() {
        // A stateful pool behind a lock...
        let pool: NodePool = NodePool::new(32, 1024);
        let lock = Mutex::new(pool);
        let mut erased = AnyAllocatorRef::new(&lock);

        let node = erased.allocate_node(32, 8).unwrap();
        assert_eq!(erased.max_node_size(), 32);
        unsafe { erased.deallocate_node(node, 32, 8) };

        // ...and a stateless heap, through the same erased type.
        let stateless = StatelessRef::<Heap>::new();
        let mut erased = AnyAllocatorRef::new(&stateless);
        let node = erased.allocate_node(128, 16).unwrap();
        unsafe { erased.deallocate_node(node, 128, 16) };

        // The accessor exposes the erased operation set directly.
        assert_eq!(
            erased.get_allocator().dyn_max(Query::Alignment),
            crate::align::MAX_ALIGNMENT
        );

        // The erased handle itself is two words, the stateless handle
        // behind it zero bytes.
        assert_eq!(
            mem::size_of::<AnyAllocatorRef<'_>>(),
            2 * mem::size_of::<usize>()
        );
    }

    #[test]
    fn erased_arrays_dispatch_by_count() {
        let pool: NodePool = NodePool::new(16, 1024);
        let lock = Mutex::new(pool);
        let mut erased = AnyAllocatorRef::new(&lock);

        let array = erased.allocate_array(4, 16, 8).unwrap();
        unsafe { array.as_ptr().write_bytes(0x17, 4 * 16) };
        unsafe { erased.deallocate_array(array, 4, 16, 8) };
    }
}
