//! Build script for hazcat_core
//!
//! Configures CUDA linking when the `cuda` feature is enabled.

fn main() {
    #[cfg(feature = "cuda")]
    {
        let cuda_paths = [
            "/usr/lib/x86_64-linux-gnu", // Ubuntu package location (check first)
            "/usr/local/cuda/lib64",
            "/usr/local/cuda-12/lib64",
            "/usr/local/cuda-11/lib64",
            "/opt/cuda/lib64",
        ];

        let mut found = false;

        // CUDA_PATH wins if it points somewhere real
        if let Ok(cuda_path) = std::env::var("CUDA_PATH") {
            let lib_path = format!("{}/lib64", cuda_path);
            if std::path::Path::new(&lib_path).exists() {
                println!("cargo:rustc-link-search=native={}", lib_path);
                found = true;
            }
        }

        if !found {
            for path in &cuda_paths {
                if std::path::Path::new(&format!("{}/libcudart.so", path)).exists() {
                    println!("cargo:rustc-link-search=native={}", path);
                    found = true;
                    break;
                }
            }
        }

        if !found {
            println!("cargo:warning=CUDA libraries not found. GPU features will fail at runtime.");
        }
        // Runtime API (cudaMalloc/cudaMemcpy/IPC) and driver API (granularity)
        println!("cargo:rustc-link-lib=dylib=cudart");
        println!("cargo:rustc-link-lib=dylib=cuda");
    }

    println!("cargo:rerun-if-env-changed=CUDA_PATH");
}
