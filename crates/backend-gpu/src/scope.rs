//! Per-call ownership of accelerator objects.
//!
//! Every object created while servicing a call is adopted by a
//! [`ResourceScope`]. Closing the scope, explicitly or by dropping it on an
//! early return, releases each adopted object exactly once in reverse
//! adoption order. Buffers are destroyed outright, so their device memory
//! is reclaimed even if a stray handle outlives the scope.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Device,
    Buffer,
    ShaderModule,
    BindGroupLayout,
    PipelineLayout,
    Pipeline,
    BindGroup,
    Other,
}

/// An accelerator object that can be owned by a [`ResourceScope`].
pub trait ScopedResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Called once when the owning scope closes. The final reference is
    /// dropped right after.
    fn release(&self) {}
}

impl ScopedResource for wgpu::Buffer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    fn release(&self) {
        self.destroy();
    }
}

impl ScopedResource for wgpu::ShaderModule {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ShaderModule
    }
}

impl ScopedResource for wgpu::BindGroupLayout {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BindGroupLayout
    }
}

impl ScopedResource for wgpu::PipelineLayout {
    fn kind(&self) -> ResourceKind {
        ResourceKind::PipelineLayout
    }
}

impl ScopedResource for wgpu::ComputePipeline {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pipeline
    }
}

impl ScopedResource for wgpu::BindGroup {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BindGroup
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub adopted: usize,
    pub released: usize,
}

impl ScopeStats {
    pub fn outstanding(&self) -> usize {
        self.adopted - self.released
    }
}

/// Counters shared across scopes, so a caller can check that every
/// adopted object was released after the scope is gone.
#[derive(Debug, Clone, Default)]
pub struct ScopeLedger {
    inner: Arc<LedgerCounts>,
}

#[derive(Debug, Default)]
struct LedgerCounts {
    adopted: AtomicUsize,
    released: AtomicUsize,
}

impl ScopeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ScopeStats {
        ScopeStats {
            adopted: self.inner.adopted.load(Ordering::SeqCst),
            released: self.inner.released.load(Ordering::SeqCst),
        }
    }
}

pub struct ResourceScope {
    label: &'static str,
    resources: Vec<Arc<dyn ScopedResource>>,
    stats: ScopeStats,
    ledger: Option<ScopeLedger>,
    closed: bool,
}

impl ResourceScope {
    pub fn open(label: &'static str) -> Self {
        debug!(scope = label, "resource scope opened");
        Self {
            label,
            resources: Vec::new(),
            stats: ScopeStats::default(),
            ledger: None,
            closed: false,
        }
    }

    pub fn with_ledger(mut self, ledger: ScopeLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Takes ownership of `resource` and hands back a shared handle that
    /// stays valid until the scope closes.
    pub fn adopt<T>(&mut self, resource: T) -> Arc<T>
    where
        T: ScopedResource + 'static,
    {
        assert!(!self.closed, "resource adopted after scope `{}` closed", self.label);
        let resource = Arc::new(resource);
        trace!(scope = self.label, kind = ?resource.kind(), "adopting resource");
        self.resources.push(resource.clone());
        self.stats.adopted += 1;
        if let Some(ledger) = &self.ledger {
            ledger.inner.adopted.fetch_add(1, Ordering::SeqCst);
        }
        resource
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn stats(&self) -> ScopeStats {
        self.stats
    }

    /// Releases everything and reports the final counts.
    pub fn close(mut self) -> ScopeStats {
        self.release_all();
        self.stats
    }

    fn release_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(resource) = self.resources.pop() {
            resource.release();
            drop(resource);
            self.stats.released += 1;
            if let Some(ledger) = &self.ledger {
                ledger.inner.released.fetch_add(1, Ordering::SeqCst);
            }
        }
        debug!(
            scope = self.label,
            released = self.stats.released,
            "resource scope closed"
        );
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the order in which tracked resources are released.
    pub(crate) struct Tracked {
        pub id: usize,
        pub log: Arc<Mutex<Vec<usize>>>,
    }

    impl ScopedResource for Tracked {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Other
        }

        fn release(&self) {
            self.log.lock().unwrap().push(self.id);
        }
    }

    fn tracked(id: usize, log: &Arc<Mutex<Vec<usize>>>) -> Tracked {
        Tracked {
            id,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn close_releases_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = ResourceScope::open("ordering");
        for id in 0..3 {
            let _ = scope.adopt(tracked(id, &log));
        }
        let stats = scope.close();
        assert_eq!(stats, ScopeStats { adopted: 3, released: 3 });
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn drop_on_early_return_releases_everything_once() {
        fn call(
            ledger: &ScopeLedger,
            log: &Arc<Mutex<Vec<usize>>>,
            compile_fails: bool,
        ) -> Result<(), &'static str> {
            let mut scope = ResourceScope::open("early-return").with_ledger(ledger.clone());
            let _device = scope.adopt(tracked(0, log));
            let _buffer = scope.adopt(tracked(1, log));
            if compile_fails {
                return Err("compile failed");
            }
            let _ = scope.adopt(tracked(2, log));
            Ok(())
        }

        let ledger = ScopeLedger::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(call(&ledger, &log, true).is_err());

        let stats = ledger.snapshot();
        assert_eq!(stats.adopted, 2);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(*log.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn handles_outliving_the_scope_see_release() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let mut scope = ResourceScope::open("stray-handle");
            scope.adopt(tracked(7, &log))
        };
        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert_eq!(Arc::strong_count(&handle), 1);
    }
}
