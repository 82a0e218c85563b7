use std::hint::black_box;

use divan::{AllocProfiler, Bencher};
use macke_bench::{buffer_module, buffer_vectors, missing_buffer};
use macke_codegen::{Backend, BackendConfig, CraneliftBackend};
use macke_eval::{Interpreter, Outcome, ScriptedHost, Value};
use macke_ir::IrModule;
use macke_ktest::VectorSources;
use macke_prepend::{PrependConfig, SamplingConfig, prepend_errors};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

fn config() -> PrependConfig {
    PrependConfig::new("count", VectorSources::default()).with_sampling(SamplingConfig::Always)
}

fn instrumented(vectors: usize) -> IrModule {
    let mut module = buffer_module();
    prepend_errors(&mut module, &config(), &buffer_vectors(vectors))
        .unwrap_or_else(|err| panic!("prepending failed in benchmark setup: {err}"));
    module
}

#[divan::bench(args = [8, 64, 512])]
fn prepend_buffer_vectors(bencher: Bencher, vectors: usize) {
    let module = buffer_module();
    let vectors = buffer_vectors(vectors);
    let config = config();
    bencher.bench(|| {
        let mut module = module.clone();
        let report = prepend_errors(&mut module, &config, black_box(&vectors))
            .unwrap_or_else(|err| panic!("prepending failed: {err}"));
        black_box(report.admitted.len())
    });
}

#[divan::bench(args = [8, 64, 512])]
fn replay_miss_through_chain(bencher: Bencher, vectors: usize) {
    let module = instrumented(vectors);
    bencher.bench(|| {
        let mut interpreter = Interpreter::new(&module, ScriptedHost::new());
        let buf = interpreter.alloc_object(missing_buffer());
        let outcome = interpreter
            .call("main", &[buf, Value::i32(16)])
            .unwrap_or_else(|err| panic!("interpretation failed: {err}"));
        assert_eq!(outcome, Outcome::Returned(Some(Value::i32(16))));
        black_box(interpreter.stats().loads)
    });
}

#[divan::bench(args = [8, 64])]
fn compile_instrumented_jit(bencher: Bencher, vectors: usize) {
    let module = instrumented(vectors);
    let config = BackendConfig::default();
    bencher.bench(|| {
        let artifact = CraneliftBackend
            .compile_module(black_box(&module), &config)
            .unwrap_or_else(|err| panic!("JIT compile failed: {err}"));
        black_box(artifact.stats.per_function.len())
    });
}
