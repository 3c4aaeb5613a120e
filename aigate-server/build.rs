fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    println!("cargo:rerun-if-env-changed=AIGATE_GIT_HASH");
    if let Ok(hash) = std::env::var("AIGATE_GIT_HASH") {
        println!("cargo:rustc-env=AIGATE_GIT_HASH={}", hash);
    }
}
