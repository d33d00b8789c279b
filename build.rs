use std::process::Command;

/// Trimmed stdout of `program`, or `None` if it is missing or fails.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn build_timestamp() -> Option<String> {
    command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).or_else(|| {
        command_output(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
            ],
        )
    })
}

fn main() {
    let stamp = build_timestamp().unwrap_or_else(|| "unknown".into());
    let sha = command_output("git", &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=BUILD_TIMESTAMP={stamp}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={sha}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
