//! End-to-end runs of the `pid1` binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

const ENV_VARS: [&str; 12] = [
    "PID1_SUBREAPER",
    "PID1_KILL_PROCESS_GROUP",
    "PID1_VERBOSITY",
    "PID1_WARN_ON_REAP",
    "PID1_REMAP_EXIT",
    "PID1_PDEATH_SIGNAL",
    "PID1_PRE",
    "PID1_POST",
    "PID1_SECCOMP_NOTIFY_SOCK_PATH",
    "PID1_SECCOMP_INTERCEPT_NET",
    "PID1_SECCOMP_SEND_PROCESS_FDS",
    "PID1_INTERNAL_ERROR_CODE",
];

fn pid1() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pid1"));
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.stdin(Stdio::null());
    cmd
}

fn run(args: &[&str]) -> Output {
    pid1().args(args).output().unwrap()
}

fn code(output: &Output) -> i32 {
    output.status.code().unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_with_deadline(child: &mut Child) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status.code().unwrap();
        }
        assert!(Instant::now() < deadline, "pid1 did not exit");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// A shell script run as `/bin/sh <path>`, never exec'd directly.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn true_exits_zero() {
    let out = run(&["--", "/bin/true"]);
    assert_eq!(code(&out), 0, "{}", stderr(&out));
}

#[test]
fn exit_code_is_propagated() {
    let out = run(&["--", "/bin/sh", "-c", "exit 42"]);
    assert_eq!(code(&out), 42);
}

#[test]
fn signal_death_is_128_plus_signal() {
    let out = run(&["--", "/bin/sh", "-c", "kill -TERM $$"]);
    assert_eq!(code(&out), 143, "{}", stderr(&out));
}

#[test]
fn remapped_codes_become_zero() {
    assert_eq!(code(&run(&["-e", "2,3", "--", "/bin/sh", "-c", "exit 2"])), 0);
    assert_eq!(code(&run(&["-e", "2,3", "--", "/bin/sh", "-c", "exit 3"])), 0);
    assert_eq!(code(&run(&["-e", "2,3", "--", "/bin/sh", "-c", "exit 4"])), 4);

    let out = pid1()
        .env("PID1_REMAP_EXIT", "2")
        .args(["--", "/bin/sh", "-c", "exit 2"])
        .output()
        .unwrap();
    assert_eq!(code(&out), 0);
}

#[test]
fn failing_pre_skips_main_and_runs_post() {
    let dir = tempfile::tempdir().unwrap();
    let pre = script(dir.path(), "pre.sh", "exit 5\n");
    let main_marker = dir.path().join("main-ran");
    let post_marker = dir.path().join("post-ran");
    let post = script(
        dir.path(),
        "post.sh",
        &format!("touch {}\nexit 1\n", post_marker.display()),
    );

    let out = pid1()
        .arg("--pre")
        .arg(format!("/bin/sh {}", pre.display()))
        .arg("--post")
        .arg(format!("/bin/sh {}", post.display()))
        .arg("--")
        .args(["/bin/sh", "-c", &format!("touch {}", main_marker.display())])
        .output()
        .unwrap();

    assert_eq!(code(&out), 5, "{}", stderr(&out));
    assert!(!main_marker.exists(), "main must not run after a failing pre");
    assert!(post_marker.exists(), "post must still run");
}

#[test]
fn post_failure_does_not_override_main() {
    let dir = tempfile::tempdir().unwrap();
    let pre = script(dir.path(), "pre.sh", "exit 0\n");
    let post = script(dir.path(), "post.sh", "exit 9\n");

    let out = pid1()
        .arg("--pre")
        .arg(format!("/bin/sh {}", pre.display()))
        .arg("--post")
        .arg(format!("/bin/sh {}", post.display()))
        .args(["--", "/bin/sh", "-c", "exit 6"])
        .output()
        .unwrap();
    assert_eq!(code(&out), 6, "{}", stderr(&out));
}

#[test]
fn warns_when_reaping_cannot_work() {
    let out = run(&["--", "/bin/true"]);
    assert_eq!(code(&out), 0);
    assert!(
        stderr(&out).contains("isn't registered as a child subreaper"),
        "{}",
        stderr(&out)
    );

    let quiet = run(&["-s", "--", "/bin/true"]);
    assert_eq!(code(&quiet), 0);
    assert!(!stderr(&quiet).contains("isn't registered as a child subreaper"));
}

#[test]
fn unreachable_seccomp_socket_only_warns() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nobody-home.sock");
    let out = pid1()
        .arg("--seccomp-socket")
        .arg(&socket)
        .args(["--", "/bin/sh", "-c", "exit 7"])
        .output()
        .unwrap();
    assert_eq!(code(&out), 7);
    assert!(stderr(&out).contains("seccomp notification disabled"), "{}", stderr(&out));
}

#[test]
fn missing_program_exits_127() {
    let out = run(&["--", "/nonexistent/pid1-test-program"]);
    assert_eq!(code(&out), 127);
}

#[test]
fn non_executable_program_exits_126() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "not-executable", "#!/bin/sh\nexit 0\n");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let out = pid1().arg("--").arg(&path).output().unwrap();
    assert_eq!(code(&out), 126);
}

#[test]
fn configuration_errors_use_internal_error_code() {
    let out = run(&["--internal-error-code", "99", "-e", "300", "--", "/bin/true"]);
    assert_eq!(code(&out), 99);

    let default = run(&["-e", "256", "--", "/bin/true"]);
    assert_eq!(code(&default), 1);
}

#[test]
fn usage_errors_exit_2() {
    let out = run(&[]);
    assert_eq!(code(&out), 2);
}

#[test]
fn sigterm_is_forwarded_to_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let body = format!(
        "trap 'exit 42' TERM; touch {}; while :; do sleep 0.05; done",
        ready.display()
    );

    let mut child = pid1().args(["--", "/bin/sh", "-c", &body]).spawn().unwrap();
    wait_for(&ready);
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    assert_eq!(wait_with_deadline(&mut child), 42);
}

#[test]
fn process_group_mode_signals_the_whole_group() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    // The trap only runs once the foreground sleep is gone, so a fast exit
    // shows the sleep got the signal too.
    let body = format!(
        "trap 'exit 42' USR1; touch {}; sleep 30; exit 1",
        ready.display()
    );

    let started = Instant::now();
    let mut child = pid1().args(["-g", "--", "/bin/sh", "-c", &body]).spawn().unwrap();
    wait_for(&ready);
    kill(Pid::from_raw(child.id() as i32), Signal::SIGUSR1).unwrap();
    assert_eq!(wait_with_deadline(&mut child), 42);
    assert!(started.elapsed() < Duration::from_secs(25));
}

#[test]
fn orphans_are_reaped_with_subreaper() {
    let out = run(&[
        "-s",
        "-w",
        "--",
        "/bin/sh",
        "-c",
        "(sleep 0.1 &); sleep 1",
    ]);
    assert_eq!(code(&out), 0, "{}", stderr(&out));
    assert!(stderr(&out).contains("reaped zombie process"), "{}", stderr(&out));
}
