fn main() {
    cc::Build::new().file("src/siginfo_t.c").compile("ccode");
    println!("cargo:rerun-if-changed=src/siginfo_t.c");
}
