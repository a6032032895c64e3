use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

struct Output {
    stdout: String,
    stderr: String,
    success: bool,
}

fn tiervm(args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_tiervm"))
        .args(args)
        .output()
        .expect("failed to execute tiervm");

    Output {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    }
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn assert_success(args: &[&str]) -> String {
    let out = tiervm(args);
    assert!(out.success, "command should succeed, stderr:\n{}", out.stderr);
    out.stdout
}

fn assert_failure(args: &[&str]) -> String {
    let out = tiervm(args);
    assert!(!out.success, "command should fail, stdout:\n{}", out.stdout);
    out.stderr
}

const COUNTDOWN: &str = "
; print 3, 2, 1 and return 0
.func main 0
    LOADINT r1, 3
    LOADINT r2, 1
loop:
    JMPF r1, done
    NATIVE_CALL r1, print, 1
    SUB r1, r1, r2
    JMP loop
done:
    RETURN r1
.end
";

#[test]
fn test_run_listing() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "countdown.tasm", COUNTDOWN);
    let stdout = assert_success(&["run", arg(&file), "--jit", "off"]);
    assert_eq!(stdout, "3\n2\n1\n0\n");
}

#[test]
fn test_run_nil_result_prints_nothing() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "nil.tasm", ".func main 0\n    RETURNNIL\n.end\n");
    assert_eq!(assert_success(&["run", arg(&file)]), "");
}

#[test]
fn test_assemble_then_run_image() {
    let dir = TempDir::new().unwrap();
    let listing = write(&dir, "countdown.tasm", COUNTDOWN);
    let image = dir.path().join("countdown.tvm");

    assert_success(&["asm", arg(&listing), "-o", arg(&image)]);
    let bytes = std::fs::read(&image).unwrap();
    assert_eq!(&bytes[..4], b"TIER");

    let stdout = assert_success(&["run", arg(&image), "--jit", "on", "--jit-threshold", "0"]);
    assert_eq!(stdout, "3\n2\n1\n0\n");
}

#[test]
fn test_disasm_roundtrip() {
    let dir = TempDir::new().unwrap();
    let listing = write(&dir, "countdown.tasm", COUNTDOWN);
    let image = dir.path().join("countdown.tvm");
    assert_success(&["asm", arg(&listing), "-o", arg(&image)]);

    let text = assert_success(&["disasm", arg(&image)]);
    assert!(text.starts_with(".func main 0\n"));
    assert!(text.contains("NATIVE_CALL r1, print, 1"));

    let again = write(&dir, "again.tasm", &text);
    assert_eq!(assert_success(&["disasm", arg(&again)]), text);

    let raw = assert_success(&["disasm", "--raw", arg(&image)]);
    assert!(raw.contains("; bootstrap"));
    assert!(raw.contains("HALT"));
}

#[test]
fn test_cfg_command() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "countdown.tasm", COUNTDOWN);
    let text = assert_success(&["cfg", arg(&file)]);
    assert!(text.starts_with("; main\n"));

    let stderr = assert_failure(&["cfg", arg(&file), "--function", "nope"]);
    assert!(stderr.contains("no function named 'nope'"));
}

#[test]
fn test_gc_stats_json() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "alloc.tasm",
        "
.func main 0
    LOADINT r0, 64
    LOADINT r1, 1
    LOADINT r2, 8
loop:
    JMPF r0, done
    NEWARRAY r3, r2
    SUB r0, r0, r1
    JMP loop
done:
    RETURNNIL
.end
",
    );
    let config = write(&dir, "tiervm.toml", "gc_threshold = 4\n");
    let out = tiervm(&["run", arg(&file), "--config", arg(&config), "--gc-stats"]);
    assert!(out.success, "stderr:\n{}", out.stderr);

    let stats: serde_json::Value = serde_json::from_str(out.stderr.trim()).unwrap();
    assert!(stats["gc"]["cycles"].as_u64().unwrap() > 0);
    assert!(stats["gc"]["freed_blocks"].as_u64().unwrap() > 0);
}

#[test]
fn test_runtime_error_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "div.tasm",
        ".func main 0\n    LOADINT r0, 1\n    LOADINT r1, 0\n    DIV r0, r0, r1\n    RETURN r0\n.end\n",
    );
    let stderr = assert_failure(&["run", arg(&file)]);
    assert!(stderr.contains("error: runtime error: division by zero"));
}

#[test]
fn test_assembly_error_reports_line() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "bad.tasm", ".func main 0\n    FROB r0\n.end\n");
    let stderr = assert_failure(&["run", arg(&file)]);
    assert!(stderr.contains("line 2"), "stderr:\n{}", stderr);
}

#[test]
fn test_missing_file() {
    let stderr = assert_failure(&["run", "/nonexistent/prog.tasm"]);
    assert!(stderr.contains("failed to read /nonexistent/prog.tasm"));
}

#[test]
fn test_bad_config_rejected() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "countdown.tasm", COUNTDOWN);
    let config = write(&dir, "tiervm.toml", "no_such_key = 1\n");
    let stderr = assert_failure(&["run", arg(&file), "--config", arg(&config)]);
    assert!(stderr.contains("invalid config"));
}
