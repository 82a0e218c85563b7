//! Module and vector generators shared by the benchmarks.

use macke_ir::{FunctionBuilder, IrLinkage, IrModule, IrParam, IrType};
use macke_ktest::{KTestObject, TestVector};

/// Length of every `buf` object produced by [`buffer_vectors`].
pub const BUFFER_LEN: usize = 16;

/// `int count(char *buf, int n)` returning `n`, called from `main`.
pub fn buffer_module() -> IrModule {
    let params = || {
        vec![
            IrParam::named("buf", IrType::Ptr),
            IrParam::named("n", IrType::I32),
        ]
    };

    let mut count = FunctionBuilder::new("count", params(), IrType::I32, IrLinkage::Internal);
    let entry = count.create_block();
    count.ret(entry, Some(count.param(1)));

    let mut main = FunctionBuilder::new("main", params(), IrType::I32, IrLinkage::External);
    let entry = main.create_block();
    let result = main.call(
        entry,
        "count",
        vec![main.param(0), main.param(1)],
        IrType::I32,
    );
    main.ret(entry, result);

    let mut module = IrModule::new("bench");
    for function in [count.finish(), main.finish()] {
        let function =
            function.unwrap_or_else(|err| panic!("benchmark module failed to build: {err}"));
        module
            .add_function(function)
            .unwrap_or_else(|err| panic!("benchmark module rejected function: {err}"));
    }
    module
}

/// `count` vectors whose buffers share a size but differ in content, so a
/// buffer of the same size walks every content check.
pub fn buffer_vectors(count: usize) -> Vec<TestVector> {
    (0..count)
        .map(|index| {
            let mut buf = vec![b'a'; BUFFER_LEN];
            buf[..8].copy_from_slice(&(index as u64).to_le_bytes());
            TestVector::new(
                format!("test{:06}.ktest", index + 1),
                vec![
                    KTestObject {
                        name: "buf".to_string(),
                        bytes: buf,
                    },
                    KTestObject {
                        name: "n".to_string(),
                        bytes: (BUFFER_LEN as i32).to_le_bytes().to_vec(),
                    },
                ],
            )
        })
        .collect()
}

/// A buffer of the vectors' size that none of them matches.
pub fn missing_buffer() -> Vec<u8> {
    vec![b'z'; BUFFER_LEN]
}
