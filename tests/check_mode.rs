//! The `check` CLI subcommand: batch diagnostics over a glob with exit
//! codes.

use std::process::Command;

use test_utils::TestProject;

fn run_check(project: &TestProject, pattern: &str) -> (i32, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_lsmcp"))
        .arg("--bin")
        .arg(env!("CARGO_BIN_EXE_stub-lsp"))
        .arg("--log-level")
        .arg("error")
        .arg("check")
        .arg("--root")
        .arg(project.root())
        .arg("--pattern")
        .arg(pattern)
        .output()
        .expect("failed to run lsmcp");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

#[test]
fn check_exits_nonzero_on_errors() {
    let project = TestProject::new(&[
        ("src/bad.ts", "const x: string = 123;\n"),
        ("src/good.ts", "const y: string = \"ok\";\n"),
    ])
    .unwrap();

    let (code, stdout) = run_check(&project, "src/*.ts");
    assert_eq!(code, 1, "stdout was: {stdout}");
    assert!(stdout.contains("src/bad.ts: 1 error"), "{stdout}");
    assert!(stdout.contains("src/good.ts: 0 errors"), "{stdout}");
}

#[test]
fn check_exits_zero_when_clean() {
    let project =
        TestProject::new(&[("src/good.ts", "const y: string = \"ok\";\n")]).unwrap();

    let (code, stdout) = run_check(&project, "src/*.ts");
    assert_eq!(code, 0, "stdout was: {stdout}");
    assert!(stdout.contains("1 file checked: 0 errors"), "{stdout}");
}

#[test]
fn check_fails_cleanly_on_a_bad_glob() {
    let project = TestProject::new(&[("src/a.ts", "const a = 1;\n")]).unwrap();
    let (code, _stdout) = run_check(&project, "src/[");
    assert_eq!(code, 1);
}
