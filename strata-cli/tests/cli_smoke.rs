use std::process::Command;

fn run_cli(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_strata");
    Command::new(exe)
        .args(args)
        .env("DBUS_SESSION_BUS_ADDRESS", "unix:path=/nonexistent/strata-test-bus")
        .output()
        .expect("strata should execute")
}

#[test]
fn help_lists_command_groups() {
    let output = run_cli(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for group in ["vfs", "tag", "filter", "backend", "sync"] {
        assert!(stdout.contains(group), "missing {group} in help");
    }
}

#[test]
fn rm_help_mentions_confirmation() {
    let output = run_cli(&["vfs", "rm", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--yes"));
    assert!(stdout.contains("--recursive"));
}

#[test]
fn usage_errors_exit_with_client_status() {
    let output = run_cli(&["vfs", "explode"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unreachable_agent_is_a_server_error() {
    let output = run_cli(&["vfs", "ls"]);
    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("strata: "));
}
