use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use macke_eval::{Interpreter, Outcome, ScriptedHost, Value};
use macke_ir::{FunctionBuilder, IrBinaryOp, IrLinkage, IrModule, IrParam, IrType};
use macke_ktest::{KTest, KTestObject};

fn macke_bin() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_macke-prepend") {
        return PathBuf::from(path);
    }

    let mut exe = std::env::current_exe().expect("test executable path should be known");
    exe.pop();
    if exe.file_name().and_then(|name| name.to_str()) == Some("deps") {
        exe.pop();
    }
    exe.join("macke-prepend")
}

/// `int f(int x) { return x + 100; }` called from `main`.
fn write_module(dir: &Path) -> PathBuf {
    let mut f = FunctionBuilder::new(
        "f",
        vec![IrParam::named("x", IrType::I32)],
        IrType::I32,
        IrLinkage::External,
    );
    let entry = f.create_block();
    let hundred = f.iconst(entry, IrType::I32, 100);
    let sum = f.binary(entry, IrBinaryOp::Add, f.param(0), hundred);
    f.ret(entry, Some(sum));

    let mut main = FunctionBuilder::new(
        "main",
        vec![IrParam::named("x", IrType::I32)],
        IrType::I32,
        IrLinkage::External,
    );
    let entry = main.create_block();
    let result = main.call(entry, "f", vec![main.param(0)], IrType::I32);
    main.ret(entry, result);

    let mut module = IrModule::new("cli");
    module.add_function(f.finish().expect("f builds")).expect("f added");
    module
        .add_function(main.finish().expect("main builds"))
        .expect("main added");

    let path = dir.join("module.json");
    std::fs::write(&path, serde_json::to_vec(&module).expect("serialize")).expect("write module");
    path
}

/// A `klee-out-0` directory with one memory error at `x == 5`.
fn write_run_directory(dir: &Path) -> PathBuf {
    let run = dir.join("klee-out-0");
    std::fs::create_dir_all(&run).expect("create run directory");
    std::fs::write(run.join("test000001.ptr.err"), b"Error: memory error\n").expect("write err");
    KTest::new(vec![KTestObject {
        name: "x".to_string(),
        bytes: 5i32.to_le_bytes().to_vec(),
    }])
    .write_to(&run.join("test000001.ktest"))
    .expect("write ktest");
    run
}

fn prepend_command(input: &Path) -> Command {
    let mut command = Command::new(macke_bin());
    command
        .arg("--input")
        .arg(input)
        .env_remove("MACKE_PREPEND_TO_FUNCTION")
        .env("RUST_LOG", "warn");
    command
}

fn output_of(command: &mut Command) -> Output {
    command.output().expect("macke-prepend should execute")
}

fn run_main(module: &IrModule, x: i32) -> Outcome {
    Interpreter::new(module, ScriptedHost::new())
        .call("main", &[Value::i32(x)])
        .expect("main runs")
}

#[test]
fn prepend_writes_instrumented_module_and_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let run = write_run_directory(dir.path());
    let output = dir.path().join("out/module.json");
    let report = dir.path().join("report.json");

    let result = output_of(
        prepend_command(&input)
            .arg("--prepend-to-function")
            .arg("f")
            .arg("--previous-klee-run-directory")
            .arg(&run)
            .arg("--sampling")
            .arg("always")
            .arg("-o")
            .arg(&output)
            .arg("--report")
            .arg(&report),
    );
    assert_eq!(
        result.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let module: IrModule =
        serde_json::from_slice(&std::fs::read(&output).expect("read output")).expect("parse output");
    assert!(module.function("__macke_error_f").is_some());
    assert_eq!(run_main(&module, 5), Outcome::Exited(0));
    assert_eq!(run_main(&module, 6), Outcome::Returned(Some(Value::i32(106))));

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&report).expect("read report")).expect("parse report");
    assert_eq!(report["target"], "f");
    assert_eq!(report["shadow"], "__macke_error_f");
    assert_eq!(report["sampling"], "always");
    assert_eq!(report["admitted"].as_array().map(Vec::len), Some(1));
}

#[test]
fn missing_target_exits_with_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let run = write_run_directory(dir.path());

    let result = output_of(
        prepend_command(&input)
            .arg("--previous-klee-run-directory")
            .arg(&run),
    );
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(
        stderr.contains("--prepend-to-function"),
        "expected target hint in stderr, got: {stderr}"
    );
    assert!(result.stdout.is_empty());
}

#[test]
fn unknown_function_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let run = write_run_directory(dir.path());

    let result = output_of(
        prepend_command(&input)
            .arg("--prepend-to-function")
            .arg("g")
            .arg("--previous-klee-run-directory")
            .arg(&run),
    );
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(
        stderr.contains("is no function inside the module"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn invalid_run_directory_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let missing = dir.path().join("klee-out-9");

    let result = output_of(
        prepend_command(&input)
            .arg("--prepend-to-function")
            .arg("f")
            .arg("--previous-klee-run-directory")
            .arg(&missing),
    );
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("is not a valid directory"), "unexpected stderr: {stderr}");
}

#[test]
fn text_emit_prints_shadow_to_stdout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let run = write_run_directory(dir.path());

    let result = output_of(
        prepend_command(&input)
            .arg("--prepend-to-function")
            .arg("f")
            .arg("--previous-klee-run-directory")
            .arg(&run)
            .arg("--emit")
            .arg("text"),
    );
    assert_eq!(result.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("@__macke_error_f("), "unexpected stdout: {stdout}");
    assert!(stdout.contains("noinline optnone"));
}

#[test]
fn object_emit_lands_next_to_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_module(dir.path());
    let run = write_run_directory(dir.path());

    let result = output_of(
        prepend_command(&input)
            .arg("--prepend-to-function")
            .arg("f")
            .arg("--previous-klee-run-directory")
            .arg(&run)
            .arg("--emit")
            .arg("object"),
    );
    assert_eq!(
        result.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    let object = std::fs::read(input.with_extension("o")).expect("object written");
    assert!(!object.is_empty());
}
