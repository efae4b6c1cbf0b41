//! Version command

/// Version string printed by `mittens version`
pub fn version_string() -> String {
    format!("mittens {}", env!("CARGO_PKG_VERSION"))
}

pub fn run() {
    println!("{}", version_string());
}
