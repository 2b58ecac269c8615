fn main() {
    cc::Build::new()
        .file("src/fault_guard.c")
        .warnings(true)
        .compile("faultguard");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/fault_guard.c");
}
