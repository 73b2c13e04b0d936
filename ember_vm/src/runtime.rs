//! The runtime: one heap, one class linker, one thread list and the
//! services the interpreter calls into.
//!
//! # Threads
//!
//! Every thread that runs managed code is attached first. Attaching
//! registers it in `Native` state; [`Runtime::invoke`] makes it `Runnable`
//! for the duration of the call.
//!
//! # Compiler hooks
//!
//! The interpreter reports hotness and asks for on-stack replacement
//! through [`JitHooks`]. Without hooks installed both are no-ops.

use crate::class_linker::{descriptors as d, ClassLinker, ClassTable};
use crate::deoptimizer::{DeoptStats, DeoptimizationContext};
use crate::instrumentation::Instrumentation;
use crate::interpreter;
use crate::mirror::{Class, Method};
use crate::monitor::MonitorTable;
use crate::options::RuntimeOptions;
use crate::thread::{ScopedObjectAccess, Thread};
use crate::thread_list::ThreadList;
use crate::transaction::Transaction;
use crate::value::JValue;
use ember_core::{EmberError, EmberResult, ObjRef};
use ember_gc::{Heap, RootInfo, RootVisitor, Tlab};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Compiler hooks
// =============================================================================

/// Callbacks into an optimizing compiler.
pub trait JitHooks: Send + Sync {
    /// `method` crossed the hotness threshold.
    fn on_method_hot(&self, _runtime: &Runtime, _thread: &Thread, _method: &Arc<Method>) {}

    /// Offer to continue `method` in compiled code from the back-edge target
    /// `dex_pc`. `Some` is the method's result; the interpreter returns it
    /// without running the rest of the frame.
    fn maybe_osr(&self, _runtime: &Runtime, _thread: &Thread, _method: &Arc<Method>, _dex_pc: u32) -> Option<JValue> {
        None
    }
}

/// Errors thrown when allocating the real exception is impossible.
#[derive(Debug, Clone, Copy)]
struct PreallocatedErrors {
    out_of_memory: ObjRef,
    no_class_def_found: ObjRef,
}

// =============================================================================
// Runtime
// =============================================================================

pub struct Runtime {
    options: RuntimeOptions,
    heap: Arc<Heap>,
    class_linker: Arc<ClassTable>,
    thread_list: ThreadList,
    instrumentation: Instrumentation,
    monitors: MonitorTable,
    deopt_stats: DeoptStats,
    transaction: RwLock<Option<Arc<Transaction>>>,
    jit_hooks: RwLock<Option<Arc<dyn JitHooks>>>,
    preallocated: Mutex<PreallocatedErrors>,
    /// Reference slot of `Throwable.detailMessage`.
    message_slot: usize,
}

impl Runtime {
    /// Create a runtime with options read from the environment.
    pub fn create() -> EmberResult<Arc<Self>> {
        Self::create_with(RuntimeOptions::from_env())
    }

    pub fn create_with(options: RuntimeOptions) -> EmberResult<Arc<Self>> {
        let heap = Arc::new(Heap::new(options.gc.clone())?);
        let class_linker = Arc::new(ClassTable::new(Arc::clone(&heap))?);

        let throwable = class_linker.find_class(d::THROWABLE)?;
        let message_slot = throwable
            .find_declared_field("detailMessage", false)
            .map(|f| f.slot as usize)
            .ok_or_else(|| EmberError::invalid_state("Throwable has no detailMessage field"))?;
        let mut tlab = Tlab::EMPTY;
        let mut preallocate = |descriptor: &str| -> EmberResult<ObjRef> {
            let class = class_linker.find_class(descriptor)?;
            heap.alloc_object(
                &mut tlab,
                class.id,
                class.instance_prims as usize,
                class.instance_refs as usize,
            )
        };
        let preallocated = PreallocatedErrors {
            out_of_memory: preallocate(d::OUT_OF_MEMORY_ERROR)?,
            no_class_def_found: preallocate(d::NO_CLASS_DEF_FOUND_ERROR)?,
        };

        info!(
            hotness_threshold = options.hotness_threshold,
            max_stack_depth = options.max_stack_depth,
            "runtime created"
        );
        Ok(Arc::new(Self {
            thread_list: ThreadList::new(options.thread_config(), options.suspend_timeout),
            options,
            heap,
            class_linker,
            instrumentation: Instrumentation::new(),
            monitors: MonitorTable::new(),
            deopt_stats: DeoptStats::new(),
            transaction: RwLock::new(None),
            jit_hooks: RwLock::new(None),
            preallocated: Mutex::new(preallocated),
            message_slot,
        }))
    }

    /// A runtime with [`RuntimeOptions::testing`].
    pub fn testing() -> Arc<Self> {
        match Self::create_with(RuntimeOptions::testing()) {
            Ok(runtime) => runtime,
            Err(e) => ember_core::fatal!("cannot create test runtime: {e}"),
        }
    }

    /// Wait for threads still attaching or detaching. Attached threads must
    /// have detached already.
    pub fn shutdown(&self) -> EmberResult<()> {
        if !self.thread_list.wait_for_pending_threads(self.options.suspend_timeout) {
            return Err(EmberError::timeout(
                "threads attaching at shutdown",
                self.options.suspend_timeout.as_millis() as u64,
            ));
        }
        let live = self.thread_list.size();
        if live != 0 {
            return Err(EmberError::invalid_state(format!("{live} threads still attached at shutdown")));
        }
        info!("runtime shut down");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn class_linker(&self) -> &ClassTable {
        &self.class_linker
    }

    pub fn thread_list(&self) -> &ThreadList {
        &self.thread_list
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    pub fn deopt_stats(&self) -> &DeoptStats {
        &self.deopt_stats
    }

    pub fn set_jit_hooks(&self, hooks: Option<Arc<dyn JitHooks>>) {
        *self.jit_hooks.write() = hooks;
    }

    fn jit_hooks(&self) -> Option<Arc<dyn JitHooks>> {
        self.jit_hooks.read().clone()
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Register the calling OS thread. The returned thread is `Native`.
    pub fn attach_current_thread(&self, name: &str) -> Arc<Thread> {
        self.thread_list.register(name)
    }

    pub fn detach_current_thread(&self, thread: &Thread) {
        self.thread_list.unregister(thread);
    }

    /// Call `method` on `thread`, which must not be `Runnable`. An
    /// exception thrown by the method is left pending.
    pub fn invoke(&self, thread: &Thread, method: &Arc<Method>, args: &[JValue]) -> JValue {
        let _soa = ScopedObjectAccess::new(thread);
        let result = interpreter::invoke_method(self, thread, method, args);
        interpreter::complete_call(self, thread, result)
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Allocate an exception of class `descriptor` carrying `message`. Falls
    /// back to a preallocated error when the class is missing or the heap is
    /// exhausted.
    pub fn new_throwable(&self, thread: &Thread, descriptor: &str, message: Option<&str>) -> ObjRef {
        let class = match self.class_linker.find_class(descriptor) {
            Ok(class) => class,
            Err(error) => {
                warn!(descriptor, %error, "unknown exception class");
                return self.preallocated.lock().no_class_def_found;
            }
        };
        let string_class = self.class_linker.well_known().string;
        let allocated = thread.with_tlab(|tlab| -> EmberResult<ObjRef> {
            let exception = self.heap.alloc_object(
                tlab,
                class.id,
                class.instance_prims as usize,
                class.instance_refs as usize,
            )?;
            if let Some(message) = message {
                let s = self.heap.alloc_string(tlab, string_class, message)?;
                self.heap.set_field_ref(exception, self.message_slot, Some(s));
            }
            Ok(exception)
        });
        match allocated {
            Ok(exception) => exception,
            Err(error) => {
                debug!(descriptor, %error, "exception allocation failed");
                self.preallocated_oome()
            }
        }
    }

    pub fn preallocated_oome(&self) -> ObjRef {
        self.preallocated.lock().out_of_memory
    }

    pub fn throw_out_of_memory(&self, thread: &Thread) {
        warn!(thread = thread.id().0, "out of memory");
        thread.set_exception(self.preallocated_oome());
    }

    /// The `detailMessage` of an exception.
    pub fn exception_message(&self, exception: ObjRef) -> Option<String> {
        self.heap
            .get_field_ref(exception, self.message_slot)
            .and_then(|s| self.heap.string_value(s))
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Record every subsequent interpreted heap write in `transaction`.
    pub fn enter_transaction(&self, transaction: Arc<Transaction>) {
        let mut active = self.transaction.write();
        ember_core::check!(active.is_none(), "nested transactions are not supported");
        *active = Some(transaction);
    }

    pub fn exit_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.write().take()
    }

    pub fn active_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.read().clone()
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction.read().is_some()
    }

    /// Run `class`'s static initializer inside a transaction. On failure or
    /// abort every write is rolled back, the class is left uninitialized and
    /// no exception remains pending.
    pub fn initialize_class_in_transaction(&self, thread: &Thread, class: &Arc<Class>) -> bool {
        let transaction = Arc::new(Transaction::new(Some(class.id)));
        self.enter_transaction(Arc::clone(&transaction));
        let ok = {
            let _soa = ScopedObjectAccess::new(thread);
            interpreter::ensure_initialized(self, thread, class)
        };
        self.exit_transaction();
        if ok && !transaction.is_aborted() {
            debug!(class = %class.descriptor, writes = transaction.len(), "transactional initialization committed");
            return true;
        }
        warn!(
            class = %class.descriptor,
            reason = transaction.abort_message().as_deref().unwrap_or("initializer threw"),
            "transactional initialization rolled back"
        );
        transaction.rollback(&self.heap);
        class.reset_initialization();
        thread.clear_exception();
        false
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Add `delta` to `method`'s hotness. Returns whether it is at or over
    /// the threshold; the compiler hook hears about the crossing once.
    pub fn report_hotness(&self, thread: &Thread, method: &Arc<Method>, delta: u32) -> bool {
        let threshold = self.options.hotness_threshold;
        let after = method.add_hotness(delta);
        let before = after.saturating_sub(delta);
        if before < threshold && after >= threshold {
            debug!(method = %method.name, hotness = after, "method is hot");
            if let Some(hooks) = self.jit_hooks() {
                hooks.on_method_hot(self, thread, method);
            }
        }
        after >= threshold
    }

    pub fn try_osr(&self, thread: &Thread, method: &Arc<Method>, dex_pc: u32) -> Option<JValue> {
        self.jit_hooks()?.maybe_osr(self, thread, method, dex_pc)
    }

    /// Save `ctx` on `thread` and mark a deoptimization pending. The frames
    /// run when the current call returns to the interpreter or the embedder.
    pub fn request_deoptimization(&self, thread: &Thread, ctx: DeoptimizationContext) {
        debug!(thread = thread.id().0, frames = ctx.frames.len(), reason = %ctx.reason, "deoptimization requested");
        thread.push_deoptimization_context(ctx);
        thread.set_deoptimization_pending();
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Visit runtime-wide roots, then the roots of every attached thread.
    /// Every thread but `self_thread` must be suspended.
    pub fn visit_roots(&self, self_thread: &Thread, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::global();
        {
            let mut guard = self.preallocated.lock();
            let pre = &mut *guard;
            for obj in [&mut pre.out_of_memory, &mut pre.no_class_def_found] {
                let mut slot = Some(*obj);
                visitor.visit_root(&mut slot, info);
                if let Some(moved) = slot {
                    *obj = moved;
                }
            }
        }
        self.class_linker.visit_roots(visitor);
        if let Some(transaction) = self.active_transaction() {
            transaction.visit_roots(visitor);
        }
        for thread in self.thread_list.snapshot(self_thread) {
            thread.visit_roots(visitor);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("threads", &self.thread_list.size())
            .field("transaction_active", &self.transaction_active())
            .finish_non_exhaustive()
    }
}
