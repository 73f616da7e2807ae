use crate::bindings::{self, HostContext};
use crate::compiler::ScriptArtifact;
use keystone_core::KeystoneError;
use mlua::{Lua, LuaOptions, StdLib};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Builds interpreter instances: fresh VM, host bindings, every compiled
/// artifact loaded so all declared symbols resolve. Kept by the pool so a
/// poisoned instance can be replaced with an identical one.
pub struct VmFactory {
    artifacts: Vec<Arc<ScriptArtifact>>,
    host: Arc<HostContext>,
}

impl VmFactory {
    pub fn new(artifacts: Vec<Arc<ScriptArtifact>>, host: Arc<HostContext>) -> Self {
        Self { artifacts, host }
    }

    pub fn build(&self) -> Result<Lua, KeystoneError> {
        // Safe VMs refuse binary chunks, and pooled instances exist to run
        // the bytecode produced by the startup compiler. Nothing else ever
        // reaches `load` with binary data.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) };

        bindings::register(&lua, Arc::clone(&self.host))
            .map_err(|e| KeystoneError::Internal(format!("host bindings: {}", e)))?;

        for artifact in &self.artifacts {
            lua.load(&artifact.bytecode[..])
                .set_name(format!("@{}", artifact.name))
                .set_mode(mlua::ChunkMode::Binary)
                .exec()
                .map_err(|e| KeystoneError::Compile {
                    name: artifact.name.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(lua)
    }
}

/// Pool acquisition counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub hits: u64,
    pub misses: u64,
    pub total_wait_micros: u64,
}

/// Fixed-cardinality pool of pre-warmed interpreter instances.
///
/// A semaphore with one permit per instance gates admission; saturated
/// callers queue until a release. There is no timeout at this layer; the
/// caller's deadline cancels the waiting future, and the RAII guard keeps
/// acquire/release paired on every exit path.
pub struct VmPool {
    vms: Mutex<Vec<Lua>>,
    semaphore: Arc<Semaphore>,
    factory: VmFactory,
    size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    wait_micros: AtomicU64,
}

impl VmPool {
    /// Pre-warm `size` instances. Fails fast if any cannot be built.
    pub fn new(size: usize, factory: VmFactory) -> Result<Arc<Self>, KeystoneError> {
        if size == 0 {
            return Err(KeystoneError::Config("pool size must be at least 1".into()));
        }

        let mut vms = Vec::with_capacity(size);
        for i in 0..size {
            vms.push(factory.build()?);
            debug!(vm_index = i, "Interpreter instance ready");
        }
        info!(pool_size = size, "Interpreter pool initialised");

        Ok(Arc::new(Self {
            vms: Mutex::new(vms),
            semaphore: Arc::new(Semaphore::new(size)),
            factory,
            size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
        }))
    }

    /// Borrow an instance, waiting if the pool is saturated.
    pub async fn acquire(self: &Arc<Self>) -> VmGuard {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                permit
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let start = Instant::now();
                let permit = Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .expect("pool semaphore is never closed");
                self.wait_micros
                    .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                permit
            }
        };

        let vm = self
            .vms
            .lock()
            .expect("pool storage lock poisoned")
            .pop()
            .expect("permit guarantees an idle instance");

        VmGuard {
            vm: Some(vm),
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Reset and return an instance. A failed reset destroys the instance
    /// and rebuilds an identical one so cardinality stays constant.
    fn release(&self, vm: Lua) {
        match Self::reset(&vm) {
            Ok(()) => {
                self.vms.lock().expect("pool storage lock poisoned").push(vm);
            }
            Err(e) => {
                warn!(error = %e, "Interpreter reset failed; replacing the instance");
                drop(vm);
                match self.factory.build() {
                    Ok(fresh) => {
                        self.vms
                            .lock()
                            .expect("pool storage lock poisoned")
                            .push(fresh);
                    }
                    Err(e) => {
                        // Startup proved the factory works; reaching this
                        // leaves the pool one instance short.
                        error!(error = %e, "Failed to rebuild interpreter instance");
                    }
                }
            }
        }
    }

    /// Clear residual execution state between borrowers.
    fn reset(vm: &Lua) -> mlua::Result<()> {
        vm.expire_registry_values();
        vm.gc_collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            available: self.vms.lock().expect("pool storage lock poisoned").len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_wait_micros: self.wait_micros.load(Ordering::Relaxed),
        }
    }

    /// Verify that every referenced handler/middleware symbol resolves to a
    /// function in a pooled instance. Run once before accepting traffic.
    pub fn validate_symbols(&self, symbols: &[&str]) -> Result<(), KeystoneError> {
        let vms = self.vms.lock().expect("pool storage lock poisoned");
        let vm = vms
            .first()
            .ok_or_else(|| KeystoneError::Internal("pool has no idle instance".into()))?;

        for symbol in symbols {
            let value: mlua::Value = vm
                .globals()
                .get(*symbol)
                .map_err(|e| KeystoneError::Internal(e.to_string()))?;
            if !matches!(value, mlua::Value::Function(_)) {
                return Err(KeystoneError::Config(format!(
                    "script symbol '{}' does not resolve to a function",
                    symbol
                )));
            }
        }
        Ok(())
    }
}

/// Exclusive borrow of one interpreter instance. Dropping the guard resets
/// the instance and returns it, then frees the admission permit. This runs
/// on unwind too, so acquire/release stay paired under panics and request
/// timeouts.
pub struct VmGuard {
    vm: Option<Lua>,
    pool: Arc<VmPool>,
    _permit: OwnedSemaphorePermit,
}

impl VmGuard {
    pub fn vm(&self) -> &Lua {
        self.vm.as_ref().expect("instance present until drop")
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.take() {
            self.pool.release(vm);
        }
        // The permit field drops after this body, waking one waiter now
        // that the instance is back in storage.
    }
}
