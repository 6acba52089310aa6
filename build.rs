//! Build script for shadowkv
//!
//! With the cuda feature on, every .cu source under src/ops/cuda/kernels is
//! compiled to PTX in OUT_DIR, and the directory is handed to the crate
//! through the SHADOWKV_PTX_DIR env var (read by ops::cuda::kernels).

fn main() {
    #[cfg(feature = "cuda")]
    cuda::build_ptx();
}

#[cfg(feature = "cuda")]
mod cuda {
    use std::env;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    const KERNEL_SOURCES: &[&str] = &["sv_reconstruct", "kv_append"];

    pub fn build_ptx() {
        let nvcc = locate_nvcc().unwrap_or_else(|| {
            panic!(
                "shadowkv's `cuda` feature compiles its kernels with nvcc, but none was \
                 found; set CUDA_HOME (or CUDA_PATH) to the toolkit root, or put the \
                 toolkit's bin directory on PATH"
            )
        });

        let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR"));
        let src_dir = Path::new("src/ops/cuda/kernels");

        for name in KERNEL_SOURCES {
            let cu = src_dir.join(format!("{name}.cu"));
            println!("cargo:rerun-if-changed={}", cu.display());
            assert!(
                cu.exists(),
                "kernel source {} is missing from the source tree",
                cu.display()
            );
            compile(&nvcc, &cu, &out_dir.join(format!("{name}.ptx")));
        }

        println!("cargo:rustc-env=SHADOWKV_PTX_DIR={}", out_dir.display());
    }

    fn compile(nvcc: &Path, cu: &Path, ptx: &Path) {
        let result = Command::new(nvcc)
            .args(["-ptx", "-O3", "--use_fast_math", "-arch=sm_75"])
            .arg(cu)
            .arg("-o")
            .arg(ptx)
            .output()
            .unwrap_or_else(|e| panic!("failed to invoke {}: {}", nvcc.display(), e));

        if !result.status.success() {
            panic!(
                "nvcc rejected {}:\n{}{}",
                cu.display(),
                String::from_utf8_lossy(&result.stdout),
                String::from_utf8_lossy(&result.stderr)
            );
        }
    }

    /// Toolkit env vars first, then PATH, then the usual install roots.
    fn locate_nvcc() -> Option<PathBuf> {
        for var in ["CUDA_HOME", "CUDA_PATH"] {
            if let Ok(root) = env::var(var) {
                let candidate = Path::new(&root).join("bin").join("nvcc");
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }

        if Command::new("nvcc").arg("--version").output().is_ok() {
            return Some(PathBuf::from("nvcc"));
        }

        ["/usr/local/cuda", "/usr/local/cuda-12", "/opt/cuda"]
            .iter()
            .map(|root| Path::new(root).join("bin").join("nvcc"))
            .find(|candidate| candidate.exists())
    }
}
