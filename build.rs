fn main() {
    // ESP-IDF environment is only needed for device builds (xtensa or riscv espidf targets)
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.ends_with("-espidf") {
        embuild::espidf::sysenv::output();
    }
}
