//! Git repository detection for hook payloads.

use std::path::Path;
use std::process::Command;

/// Name of the git repository containing `cwd`, if any
pub fn repo_name(cwd: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["-C", cwd, "rev-parse", "--show-toplevel"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let toplevel = String::from_utf8(output.stdout).ok()?;
    name_from_toplevel(&toplevel)
}

/// Basename of a `git rev-parse --show-toplevel` line
fn name_from_toplevel(toplevel: &str) -> Option<String> {
    let toplevel = toplevel.trim();
    if toplevel.is_empty() {
        return None;
    }
    Path::new(toplevel)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
