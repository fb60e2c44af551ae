//! Kernel program registry
//!
//! Process-wide cache from full kernel name to compiled program. Injected
//! into operators through the [`Runtime`](crate::runtime::Runtime); every
//! mutation happens under one host mutex.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{ComputeBackend, Program};
use crate::error::RuntimeError;
use crate::sync::HostMutex;

/// Registry statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub hits: u64,
    pub misses: u64,
    pub compiled: u64,
    pub failures: u64,
}

#[derive(Default)]
struct ProgramCache {
    programs: HashMap<String, Arc<dyn Program>>,
    stats: RegistryStats,
}

pub struct KernelRegistry {
    backend: Arc<dyn ComputeBackend>,
    cache: HostMutex<ProgramCache>,
}

impl KernelRegistry {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            cache: HostMutex::init("kernel-registry", ProgramCache::default()),
        }
    }

    /// Look up `name`, compiling it on first use.
    ///
    /// Compilation happens under the lock so concurrent initializers of the
    /// same variant compile it once.
    pub fn get_or_compile(&self, name: &str) -> Result<Arc<dyn Program>, RuntimeError> {
        let mut cache = self.cache.acquire()?;

        if let Some(program) = cache.programs.get(name) {
            let program = Arc::clone(program);
            cache.stats.hits += 1;
            log::debug!("Kernel cache HIT: {}", name);
            return Ok(program);
        }

        cache.stats.misses += 1;
        log::debug!("Kernel cache MISS: {} (compiling)", name);

        match self.backend.compile(name) {
            Ok(program) => {
                cache.stats.compiled += 1;
                cache.programs.insert(name.to_string(), Arc::clone(&program));
                log::info!(
                    "Kernel compiled: {} (args={}, cache_size={})",
                    name,
                    program.signature().len(),
                    cache.programs.len()
                );
                Ok(program)
            }
            Err(e) => {
                cache.stats.failures += 1;
                log::warn!("Kernel resolution failed: {}", e);
                Err(e)
            }
        }
    }

    /// Warm the cache. Returns the number of programs compiled; a name that
    /// fails is logged and skipped.
    pub fn precompile<S: AsRef<str>>(&self, names: &[S]) -> usize {
        let before = self.stats().map(|s| s.compiled).unwrap_or(0);
        for name in names {
            if let Err(e) = self.get_or_compile(name.as_ref()) {
                log::warn!("Precompile skipped {}: {}", name.as_ref(), e);
            }
        }
        let after = self.stats().map(|s| s.compiled).unwrap_or(before);
        log::info!("Precompiled {} kernel(s)", after - before);
        (after - before) as usize
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache
            .acquire()
            .map(|c| c.programs.contains_key(name))
            .unwrap_or(false)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.acquire().map(|c| c.programs.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> Result<RegistryStats, RuntimeError> {
        Ok(self.cache.acquire()?.stats.clone())
    }

    /// Drop every cached program.
    pub fn clear(&self) -> Result<(), RuntimeError> {
        let mut cache = self.cache.acquire()?;
        log::info!("Clearing kernel cache ({} entries)", cache.programs.len());
        cache.programs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::config::RuntimeConfig;

    fn registry() -> KernelRegistry {
        KernelRegistry::new(Arc::new(HostBackend::new(&RuntimeConfig::default()).unwrap()))
    }

    #[test]
    fn test_second_lookup_hits() {
        let r = registry();
        let a = r.get_or_compile("gather_FP32").unwrap();
        let b = r.get_or_compile("gather_FP32").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = r.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.compiled, 1);
        assert!(r.is_cached("gather_FP32"));
    }

    #[test]
    fn test_unknown_name_is_a_resolution_error() {
        let r = registry();
        let err = r.get_or_compile("no_such_kernel_FP32").err().unwrap();
        assert!(matches!(err, RuntimeError::Resolution { .. }));
        assert_eq!(r.cache_size(), 0);
        assert_eq!(r.stats().unwrap().failures, 1);
    }

    #[test]
    fn test_precompile_counts_successes() {
        let r = registry();
        let n = r.precompile(&["gather_FP32", "tanh_FP16", "bogus_FP32", "gather_FP32"]);
        assert_eq!(n, 2);
        assert_eq!(r.cache_size(), 2);
        r.clear().unwrap();
        assert_eq!(r.cache_size(), 0);
    }
}
