use std::process::{Command, Output};

/// Run git in the crate root; `None` when git is not installed
fn git<const N: usize>(args: [&str; N]) -> Option<Output> {
    Command::new("git").args(args).output().ok()
}

fn version_label() -> String {
    let Some(head) = git(["rev-parse", "--short", "HEAD"]).filter(|o| o.status.success()) else {
        return "unknown".to_string();
    };
    let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
    // `git diff --quiet` exits non-zero when the worktree has changes
    let dirty = git(["diff", "--quiet"]).is_some_and(|o| !o.status.success());
    if dirty { format!("{hash}-dirty") } else { hash }
}

fn main() {
    println!("cargo:rustc-env=GIT_HASH={}", version_label());
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
    println!("cargo:rerun-if-changed=.git/index");
}
