use std::process::Command;

use chrono::Utc;

/// Output of a git command, if git is available and the build runs inside a checkout
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");

    // YYYY.MM.DD, plus +g<short sha> when built from git
    let mut build_id = Utc::now().format("%Y.%m.%d").to_string();
    if let Some(sha) = git(&["rev-parse", "--short", "HEAD"]) {
        build_id.push_str("+g");
        build_id.push_str(&sha);
    }
    println!("cargo:rustc-env=AYABD_BUILD_ID={build_id}");
}
