//! PTX module loading for the cache kernels
//!
//! Modules are JIT-loaded from the PTX that build.rs emitted and cached per
//! (device ordinal, module name); decode steps after the first reuse the
//! loaded code. Lookups vastly outnumber loads, hence the read-write lock.

use cudarc::driver::safe::{CudaContext, CudaFunction, CudaModule};
use cudarc::nvrtc::Ptx;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};

/// Where build.rs left the compiled PTX.
const PTX_DIR: &str = env!("SHADOWKV_PTX_DIR");

/// Module names
pub const SV_RECONSTRUCT_MODULE: &str = "sv_reconstruct";
pub const KV_APPEND_MODULE: &str = "kv_append";

type ModuleKey = (usize, &'static str);

static LOADED: OnceLock<RwLock<HashMap<ModuleKey, Arc<CudaModule>>>> = OnceLock::new();

fn loaded() -> &'static RwLock<HashMap<ModuleKey, Arc<CudaModule>>> {
    LOADED.get_or_init(|| RwLock::new(HashMap::new()))
}

fn lock_poisoned<E: std::fmt::Display>(e: E) -> Error {
    Error::KernelError {
        reason: format!("module cache lock poisoned: {e}"),
    }
}

/// JIT-load `name` on the context's device, reusing an earlier load when one
/// exists.
pub fn cached_module(
    context: &Arc<CudaContext>,
    device_index: usize,
    name: &'static str,
) -> Result<Arc<CudaModule>> {
    let key = (device_index, name);
    {
        let map = loaded().read().map_err(lock_poisoned)?;
        if let Some(module) = map.get(&key) {
            return Ok(module.clone());
        }
    }

    let ptx = Ptx::from_file(format!("{}/{}.ptx", PTX_DIR, name));
    let module = context.load_module(ptx).map_err(|e| Error::KernelError {
        reason: format!(
            "PTX module '{}' did not load on device {}: {:?} \
             (was the crate built on this machine with the cuda feature?)",
            name, device_index, e
        ),
    })?;

    let mut map = loaded().write().map_err(lock_poisoned)?;
    Ok(map.entry(key).or_insert(module).clone())
}

/// Resolve one kernel entry point inside a loaded module.
pub fn kernel(module: &Arc<CudaModule>, name: &str) -> Result<CudaFunction> {
    module.load_function(name).map_err(|e| Error::KernelError {
        reason: format!(
            "kernel entry point '{}' missing from module: {:?} \
             (entry names must match the extern \"C\" symbols in the .cu source)",
            name, e
        ),
    })
}
