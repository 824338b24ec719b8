fn main() {
    // Windows-specific configuration
    #[cfg(target_os = "windows")]
    {
        // Configure static linking for xz2/lzma
        println!("cargo:rustc-link-search=/usr/x86_64-w64-mingw32/lib");
        println!("cargo:rustc-link-search=/usr/mingw64/lib");
        println!("cargo:rustc-link-lib=static=lzma");

        // Force static linking of C runtime
        println!("cargo:rustc-link-arg=-static-libgcc");
        println!("cargo:rustc-link-arg=-static-libstdc++");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
