use std::env;
use std::path::PathBuf;

fn main() {
    // Handle CUDA feature
    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        // Find the toolkit - Use `which` crate first for better cross-platform compatibility
        let toolkit = match which::which("nvcc") {
            // nvcc lives in <toolkit>/bin
            Ok(path) => path.parent().and_then(|bin| bin.parent()).map(PathBuf::from),
            Err(_) => {
                // Fallback to checking CUDA_PATH or common locations if `which` fails
                if let Ok(cuda_path) = env::var("CUDA_PATH") {
                    Some(PathBuf::from(cuda_path))
                } else {
                    ["/usr/local/cuda", "/opt/cuda"]
                        .iter()
                        .map(PathBuf::from)
                        .find(|p| p.exists())
                }
            }
        };

        match &toolkit {
            Some(root) => {
                println!("cargo:warning=Using CUDA toolkit at: {:?}", root);
                for lib_dir in ["lib64", "lib", "lib/x64"] {
                    let dir = root.join(lib_dir);
                    if dir.exists() {
                        println!("cargo:rustc-link-search=native={}", dir.display());
                    }
                }
            }
            None => println!(
                "cargo:warning=CUDA toolkit not found. Set CUDA_PATH or put nvcc in PATH."
            ),
        }

        // Configure cuBLAS linking
        if let Ok(lib_dir) = env::var("CUBLAS_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", lib_dir);
        }
        if let Ok(lib_dir) = env::var("CUDNN_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", lib_dir);
        }

        // Link against cuBLAS
        if env::var("CUBLAS_STATIC").is_ok() {
            println!("cargo:rustc-link-lib=static=cublas");
        } else {
            println!("cargo:rustc-link-lib=dylib=cublas");
        }
        for lib in ["cudart", "cublasLt", "cusolver", "cusparse", "cudnn"] {
            println!("cargo:rustc-link-lib=dylib={}", lib);
        }

        // Ensure rebuild if relevant env vars change
        println!("cargo:rerun-if-env-changed=CUDA_PATH");
        println!("cargo:rerun-if-env-changed=CUBLAS_LIB_DIR");
        println!("cargo:rerun-if-env-changed=CUBLAS_STATIC");
        println!("cargo:rerun-if-env-changed=CUDNN_LIB_DIR");
    } else {
        println!("cargo:warning=CUDA feature not enabled, skipping CUDA link configuration.");
    }
}
