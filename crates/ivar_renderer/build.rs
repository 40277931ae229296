// Build script for linking the Embree library
//
// Only links when the `embree` feature is enabled.
// Windows: vcpkg install embree[geometry-triangle,geometry-curve,geometry-instance]:x64-windows

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var_os("CARGO_FEATURE_EMBREE").is_none() {
        return;
    }

    println!("cargo:rustc-link-lib=embree4");

    if let Ok(vcpkg_root) = std::env::var("VCPKG_ROOT") {
        let lib_path = format!("{}\\installed\\x64-windows\\lib", vcpkg_root);
        println!("cargo:rustc-link-search=native={}", lib_path);
    }
    if let Ok(embree_dir) = std::env::var("EMBREE_DIR") {
        println!("cargo:rustc-link-search=native={}/lib", embree_dir);
    }
}
