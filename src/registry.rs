//! Thread-affine lifetime tracking for native resources.
//!
//! Vulkan objects frequently have to be destroyed on the thread whose context created
//! them, while the code that decides an object is no longer needed (a cache eviction
//! policy, a worker finishing with a staging buffer) may run anywhere. The registry
//! splits teardown in two phases:
//!
//! - [`Managed::request_free`] may be called from any thread. It hands the resource
//!   to its heap through a lock-free queue and returns immediately.
//! - [`ObjectHeap::collect`] runs on the heap's owning thread and performs the
//!   actual native free for everything queued so far.
//!
//! Each thread that creates resources attaches an [`ObjectHeap`] through a
//! [`Registry`] and passes it to the allocation functions:
//!
//! ```no_run
//! # use pumicite_memory::{Allocator, registry::Registry, ash::vk};
//! # fn run(allocator: Allocator) -> pumicite_memory::Result<()> {
//! let registry = Registry::new();
//! let heap = registry.attach_current_thread();
//!
//! let buffer = allocator.alloc_shared_buffer(
//!     &heap,
//!     &vk::BufferCreateInfo {
//!         size: 1024,
//!         usage: vk::BufferUsageFlags::STORAGE_BUFFER,
//!         ..Default::default()
//!     },
//!     &Default::default(),
//! )?;
//!
//! // Hand the buffer to another thread, which releases it when done.
//! std::thread::spawn(move || buffer.request_free()).join().unwrap();
//!
//! // Back on the owning thread, perform the native free.
//! heap.collect()?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Debug, Display},
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::ThreadId,
};

use ash::vk;

use crate::error::{Error, Result};

/// A native resource whose destruction is deferred to its owning thread.
pub trait Resource: Send + 'static {
    /// A short type label used by [`HeapStatistics`].
    fn kind(&self) -> &'static str;

    /// The usage flags of buffer resources.
    fn buffer_usage(&self) -> Option<vk::BufferUsageFlags> {
        None
    }

    /// Releases the native handles.
    ///
    /// Called exactly once, on the owning thread of the heap the resource was
    /// registered with.
    fn free(&mut self);
}

/// Identifies a resource within its [`ObjectHeap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

struct LiveEntry {
    kind: &'static str,
    buffer_usage: Option<vk::BufferUsageFlags>,
}

/// A resource handed back to its heap, waiting for the next collection pass.
struct Retired {
    id: ResourceId,
    resource: Box<dyn Resource>,
}

/// Per-thread bookkeeping of live resources and pending frees.
///
/// Reference-counted and cheap to clone. The heap is bound to the thread that
/// created it: registration, collection and statistics must run there. Only
/// [`Managed::request_free`] may be used from other threads.
#[derive(Clone)]
pub struct ObjectHeap(Arc<HeapInner>);

struct HeapInner {
    owner: ThreadId,
    owner_name: Option<String>,
    next_id: AtomicU64,
    /// Only touched from the owning thread.
    live: Mutex<HashMap<ResourceId, LiveEntry>>,
    sender: crossbeam_channel::Sender<Retired>,
    receiver: crossbeam_channel::Receiver<Retired>,
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        let pending = self.receiver.len();
        if pending > 0 {
            tracing::warn!(
                thread = ?self.owner,
                pending,
                "Object heap dropped with pending frees; native handles leaked"
            );
        }
    }
}

impl PartialEq for ObjectHeap {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ObjectHeap {}
impl Debug for ObjectHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("owner", &self.0.owner)
            .field("owner_name", &self.0.owner_name)
            .finish_non_exhaustive()
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectHeap {
    /// Creates a heap owned by the calling thread.
    ///
    /// Most code should use [`Registry::attach_current_thread`] instead, which
    /// also records the heap in the process-wide heap set.
    pub fn new() -> Self {
        let thread = std::thread::current();
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self(Arc::new(HeapInner {
            owner: thread.id(),
            owner_name: thread.name().map(str::to_owned),
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            sender,
            receiver,
        }))
    }

    /// The thread this heap is bound to.
    pub fn owner(&self) -> ThreadId {
        self.0.owner
    }

    /// Fails with [`Error::ForeignThread`] unless called on the owning thread.
    pub fn ensure_owner(&self) -> Result<()> {
        let caller = std::thread::current().id();
        if caller != self.0.owner {
            return Err(Error::ForeignThread {
                owner: self.0.owner,
                caller,
            });
        }
        Ok(())
    }

    /// Starts tracking `resource`. Must be called on the owning thread.
    ///
    /// On error the resource is dropped without being freed.
    pub fn register<R: Resource>(&self, resource: R) -> Result<Managed<R>> {
        self.ensure_owner()?;
        let id = ResourceId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        self.0.live.lock().unwrap().insert(
            id,
            LiveEntry {
                kind: resource.kind(),
                buffer_usage: resource.buffer_usage(),
            },
        );
        Ok(Managed {
            resource: ManuallyDrop::new(resource),
            id,
            heap: self.clone(),
        })
    }

    /// Frees every resource that was queued for destruction when the pass
    /// started, in the order the requests were made. Returns the number of
    /// resources freed.
    ///
    /// Resources queued while the pass runs are left for the next one.
    pub fn collect(&self) -> Result<usize> {
        self.ensure_owner()?;
        let pending = self.0.receiver.len();
        let mut freed = 0;
        for _ in 0..pending {
            let Ok(mut retired) = self.0.receiver.try_recv() else {
                break;
            };
            self.0.live.lock().unwrap().remove(&retired.id);
            tracing::trace!(id = ?retired.id, kind = retired.resource.kind(), "free");
            retired.resource.free();
            freed += 1;
        }
        if freed > 0 {
            tracing::debug!(thread = ?self.0.owner, freed, "collected object heap");
        }
        Ok(freed)
    }

    /// Whether the resource is still tracked, i.e. it has not been collected yet.
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.0.live.lock().unwrap().contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.0.live.lock().unwrap().len()
    }

    /// Number of resources waiting for the next collection pass.
    pub fn pending_count(&self) -> usize {
        self.0.receiver.len()
    }

    /// Snapshot of the live resources. Must be called on the owning thread.
    pub fn statistics(&self) -> Result<HeapStatistics> {
        self.ensure_owner()?;
        let live = self.0.live.lock().unwrap();
        let mut objects_by_kind = BTreeMap::new();
        let mut buffers_by_usage = BTreeMap::new();
        for entry in live.values() {
            *objects_by_kind.entry(entry.kind).or_insert(0) += 1;
            if let Some(usage) = entry.buffer_usage {
                *buffers_by_usage.entry(usage.as_raw()).or_insert(0) += 1;
            }
        }
        Ok(HeapStatistics {
            thread: self.0.owner,
            thread_name: self.0.owner_name.clone(),
            live_objects: live.len(),
            objects_by_kind,
            buffers_by_usage,
        })
    }
}

/// An owning handle to a resource registered with an [`ObjectHeap`].
///
/// Dereferences to the resource. The handle can be moved to any thread; release it
/// with [`request_free`](Self::request_free). Because the handle is consumed, a
/// resource cannot be queued twice.
///
/// Dropping the handle without calling `request_free` leaks the native handles and
/// leaves the resource in the heap's live set.
pub struct Managed<R: Resource> {
    resource: ManuallyDrop<R>,
    id: ResourceId,
    heap: ObjectHeap,
}

impl<R: Resource> Managed<R> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The heap this resource was registered with.
    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    /// Queues the resource for destruction on its owning thread.
    ///
    /// Never blocks. The native free happens during the owning thread's next
    /// [`ObjectHeap::collect`].
    pub fn request_free(self) {
        let mut this = ManuallyDrop::new(self);
        // `this` is never dropped, so both fields are moved out exactly once.
        let (resource, heap) = unsafe {
            (
                ManuallyDrop::take(&mut this.resource),
                std::ptr::read(&this.heap),
            )
        };
        heap.0
            .sender
            .send(Retired {
                id: this.id,
                resource: Box::new(resource),
            })
            .unwrap();
    }
}

impl<R: Resource> Deref for Managed<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}
impl<R: Resource> DerefMut for Managed<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.resource
    }
}
impl<R: Resource + Debug> Debug for Managed<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Managed")
            .field("id", &self.id)
            .field("resource", &*self.resource)
            .finish()
    }
}

impl<R: Resource> Drop for Managed<R> {
    fn drop(&mut self) {
        tracing::warn!(
            id = ?self.id,
            kind = self.resource.kind(),
            "Managed resource dropped without request_free; native handles leaked"
        );
        unsafe { ManuallyDrop::drop(&mut self.resource) }
    }
}

/// Live-object counts of one [`ObjectHeap`].
///
/// The [`Display`] implementation renders a human-readable dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStatistics {
    pub thread: ThreadId,
    pub thread_name: Option<String>,
    pub live_objects: usize,
    pub objects_by_kind: BTreeMap<&'static str, usize>,
    /// Buffer counts keyed by the raw value of their usage flags.
    pub buffers_by_usage: BTreeMap<vk::Flags, usize>,
}

impl HeapStatistics {
    pub fn count(&self, kind: &str) -> usize {
        self.objects_by_kind.get(kind).copied().unwrap_or(0)
    }
}

impl Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHeap (thread {:?}", self.thread)?;
        if let Some(name) = &self.thread_name {
            write!(f, " \"{name}\"")?;
        }
        writeln!(f, "): {} objects", self.live_objects)?;
        writeln!(f, "Objects:")?;
        for (kind, count) in &self.objects_by_kind {
            writeln!(f, "  {kind}: {count}")?;
        }
        writeln!(f, "Buffer count per usage:")?;
        for (&usage, count) in &self.buffers_by_usage {
            writeln!(
                f,
                "  {usage:#x}: {count} ({:?})",
                vk::BufferUsageFlags::from_raw(usage)
            )?;
        }
        Ok(())
    }
}

/// The process-wide set of object heaps, one per attached thread.
///
/// Threads attach explicitly when they start creating resources and detach when
/// they stop, so the set does not grow with every thread that ever existed.
#[derive(Clone, Default)]
pub struct Registry(Arc<Mutex<HashMap<ThreadId, ObjectHeap>>>);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the calling thread's heap, creating it on first use.
    pub fn attach_current_thread(&self) -> ObjectHeap {
        let thread = std::thread::current().id();
        self.0
            .lock()
            .unwrap()
            .entry(thread)
            .or_insert_with(|| {
                tracing::debug!(?thread, "attached object heap");
                ObjectHeap::new()
            })
            .clone()
    }

    /// The calling thread's heap, if it is attached.
    pub fn current_heap(&self) -> Option<ObjectHeap> {
        self.0
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .cloned()
    }

    /// Runs a final collection pass on the calling thread's heap and removes it
    /// from the registry. Returns the number of resources freed by that pass.
    ///
    /// Resources still alive keep the heap alive; they can still be freed through
    /// a handle to the heap obtained earlier.
    pub fn detach_current_thread(&self) -> Result<usize> {
        let Some(heap) = self.current_heap() else {
            return Ok(0);
        };
        let freed = heap.collect()?;
        let live = heap.live_count();
        if live > 0 {
            tracing::warn!(
                thread = ?heap.owner(),
                live,
                "Detaching object heap with live objects"
            );
        }
        self.0.lock().unwrap().remove(&heap.owner());
        Ok(freed)
    }

    pub fn heap_count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Renders the statistics of the calling thread's heap.
    ///
    /// Returns `None` if the calling thread is not attached.
    pub fn dump_statistics(&self) -> Option<String> {
        let heap = self.current_heap()?;
        heap.statistics().ok().map(|stats| stats.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        kind: &'static str,
        usage: Option<vk::BufferUsageFlags>,
        frees: Arc<AtomicUsize>,
    }

    impl Resource for Tracked {
        fn kind(&self) -> &'static str {
            self.kind
        }
        fn buffer_usage(&self) -> Option<vk::BufferUsageFlags> {
            self.usage
        }
        fn free(&mut self) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn buffer(usage: vk::BufferUsageFlags, frees: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            kind: "Buffer",
            usage: Some(usage),
            frees: frees.clone(),
        }
    }

    fn image(frees: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            kind: "Image",
            usage: None,
            frees: frees.clone(),
        }
    }

    #[test]
    fn freed_exactly_once_after_collect() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let resource = heap
            .register(buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, &frees))
            .unwrap();
        let id = resource.id();
        assert!(heap.is_live(id));

        resource.request_free();
        assert!(heap.is_live(id));
        assert_eq!(heap.pending_count(), 1);
        assert_eq!(frees.load(Ordering::SeqCst), 0);

        assert_eq!(heap.collect().unwrap(), 1);
        assert!(!heap.is_live(id));
        assert_eq!(frees.load(Ordering::SeqCst), 1);

        assert_eq!(heap.collect().unwrap(), 0);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    struct Ordered {
        tag: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Resource for Ordered {
        fn kind(&self) -> &'static str {
            "Ordered"
        }
        fn free(&mut self) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    /// Releases another resource while being freed.
    struct Chained {
        next: Option<Managed<Tracked>>,
    }

    impl Resource for Chained {
        fn kind(&self) -> &'static str {
            "Chained"
        }
        fn free(&mut self) {
            if let Some(next) = self.next.take() {
                next.request_free();
            }
        }
    }

    #[test]
    fn collect_frees_in_request_order() {
        let heap = ObjectHeap::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles: Vec<_> = (0..5)
            .map(|tag| {
                heap.register(Ordered {
                    tag,
                    log: log.clone(),
                })
                .unwrap()
            })
            .collect();

        while let Some(handle) = handles.pop() {
            handle.request_free();
        }
        assert_eq!(heap.collect().unwrap(), 5);
        assert_eq!(*log.lock().unwrap(), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn frees_requested_during_collect_wait_for_next_pass() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let inner = heap.register(image(&frees)).unwrap();
        let inner_id = inner.id();
        let outer = heap.register(Chained { next: Some(inner) }).unwrap();

        outer.request_free();
        assert_eq!(heap.collect().unwrap(), 1);
        assert!(heap.is_live(inner_id));
        assert_eq!(heap.pending_count(), 1);
        assert_eq!(frees.load(Ordering::SeqCst), 0);

        assert_eq!(heap.collect().unwrap(), 1);
        assert!(!heap.is_live(inner_id));
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn dropping_heap_with_pending_frees_does_not_free() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        heap.register(image(&frees)).unwrap().request_free();
        assert_eq!(heap.pending_count(), 1);
        drop(heap);
        assert_eq!(frees.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn collect_from_foreign_thread_fails() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let resource = heap.register(image(&frees)).unwrap();
        let id = resource.id();
        resource.request_free();

        let foreign = heap.clone();
        let result = std::thread::spawn(move || foreign.collect())
            .join()
            .unwrap();
        assert!(matches!(result, Err(Error::ForeignThread { .. })));
        assert!(heap.is_live(id));
        assert_eq!(frees.load(Ordering::SeqCst), 0);

        assert_eq!(heap.collect().unwrap(), 1);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_free_from_another_thread() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| heap.register(image(&frees)).unwrap())
            .collect();

        std::thread::scope(|s| {
            for handle in handles {
                s.spawn(move || handle.request_free());
            }
        });
        assert_eq!(heap.live_count(), 4);
        assert_eq!(heap.collect().unwrap(), 4);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(frees.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn register_from_foreign_thread_fails() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let foreign = heap.clone();
        let frees2 = frees.clone();
        let registered = std::thread::spawn(move || foreign.register(image(&frees2)).is_ok())
            .join()
            .unwrap();
        assert!(!registered);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn dropped_handle_stays_live() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let resource = heap.register(image(&frees)).unwrap();
        let id = resource.id();
        drop(resource);
        assert_eq!(heap.collect().unwrap(), 0);
        assert!(heap.is_live(id));
        assert_eq!(frees.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn statistics_by_kind_and_usage() {
        let heap = ObjectHeap::new();
        let frees = Arc::new(AtomicUsize::new(0));
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        let a = heap.register(buffer(storage, &frees)).unwrap();
        let b = heap.register(buffer(storage, &frees)).unwrap();
        let c = heap
            .register(buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &frees))
            .unwrap();
        let d = heap.register(image(&frees)).unwrap();

        let stats = heap.statistics().unwrap();
        assert_eq!(stats.live_objects, 4);
        assert_eq!(stats.count("Buffer"), 3);
        assert_eq!(stats.count("Image"), 1);
        assert_eq!(stats.buffers_by_usage[&storage.as_raw()], 2);
        assert_eq!(
            stats.buffers_by_usage[&vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()],
            1
        );

        let text = stats.to_string();
        assert!(text.contains("4 objects"));
        assert!(text.contains("Buffer: 3"));
        assert!(text.contains("STORAGE_BUFFER"));
        assert!(text.contains("VERTEX_BUFFER"));

        for handle in [a, b, c, d] {
            handle.request_free();
        }
        heap.collect().unwrap();
        let stats = heap.statistics().unwrap();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.count("Buffer"), 0);
        assert!(stats.buffers_by_usage.is_empty());
    }

    #[test]
    fn statistics_from_foreign_thread_fails() {
        let heap = ObjectHeap::new();
        let foreign = heap.clone();
        let result = std::thread::spawn(move || foreign.statistics().is_err())
            .join()
            .unwrap();
        assert!(result);
    }

    #[test]
    fn registry_attach_and_detach() {
        let registry = Registry::new();
        assert!(registry.current_heap().is_none());
        assert!(registry.dump_statistics().is_none());

        let heap = registry.attach_current_thread();
        assert_eq!(registry.attach_current_thread(), heap);
        assert_eq!(registry.heap_count(), 1);

        let other = registry.clone();
        let worker_heap = std::thread::spawn(move || other.attach_current_thread())
            .join()
            .unwrap();
        assert_ne!(worker_heap, heap);
        assert_eq!(registry.heap_count(), 2);

        let frees = Arc::new(AtomicUsize::new(0));
        heap.register(image(&frees)).unwrap().request_free();
        assert!(registry.dump_statistics().unwrap().contains("1 objects"));

        assert_eq!(registry.detach_current_thread().unwrap(), 1);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert!(registry.current_heap().is_none());
        assert_eq!(registry.heap_count(), 1);
        assert_eq!(registry.detach_current_thread().unwrap(), 0);
    }
}
