//! External functions the interpreter does not implement itself.

use std::collections::{BTreeMap, VecDeque};

use macke_ir::IrType;

use crate::EvalError;
use crate::value::Value;

/// Largest value `rand()` returns.
pub const RAND_MAX: i32 = i32::MAX;

/// Resolves calls to declared (bodiless) functions.
///
/// `ret` is the callee's declared return type; a host returns `None` exactly
/// when it is `Void`.
pub trait Host {
    fn call(&mut self, name: &str, args: &[Value], ret: IrType) -> Result<Option<Value>, EvalError>;
}

/// Deterministic libc stand-in for tests.
///
/// `time` returns a fixed clock, `srand` records its seed, and `rand` replays
/// scripted values before falling back to a seeded generator. Named `f64`
/// samplers replay their own scripts.
#[derive(Debug, Clone)]
pub struct ScriptedHost {
    clock: i64,
    rand_script: VecDeque<i32>,
    rand_state: u64,
    seeds: Vec<i32>,
    samplers: BTreeMap<String, VecDeque<f64>>,
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self {
            clock: 0,
            rand_script: VecDeque::new(),
            rand_state: 1,
            seeds: Vec::new(),
            samplers: BTreeMap::new(),
        }
    }
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rand(mut self, values: impl IntoIterator<Item = i32>) -> Self {
        self.rand_script.extend(values);
        self
    }

    pub fn with_sampler(mut self, name: &str, values: impl IntoIterator<Item = f64>) -> Self {
        self.samplers
            .entry(name.to_string())
            .or_default()
            .extend(values);
        self
    }

    /// Seeds passed to `srand`, in call order.
    pub fn seeds(&self) -> &[i32] {
        &self.seeds
    }

    fn next_rand(&mut self) -> i32 {
        if let Some(value) = self.rand_script.pop_front() {
            return value;
        }
        self.rand_state = self
            .rand_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.rand_state >> 33) as i32) & RAND_MAX
    }
}

impl Host for ScriptedHost {
    fn call(&mut self, name: &str, args: &[Value], ret: IrType) -> Result<Option<Value>, EvalError> {
        match (name, ret) {
            ("time", IrType::I64) => Ok(Some(Value::i64(self.clock))),
            ("srand", IrType::Void) => {
                let seed = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| EvalError::HostCall {
                        name: name.to_string(),
                        detail: "expected an integer seed".to_string(),
                    })?;
                self.seeds.push(seed as i32);
                self.rand_state = seed as u32 as u64;
                Ok(None)
            }
            ("rand", IrType::I32) => Ok(Some(Value::i32(self.next_rand()))),
            (_, IrType::F64) => {
                let script = self
                    .samplers
                    .get_mut(name)
                    .ok_or_else(|| EvalError::UnknownExternal {
                        name: name.to_string(),
                    })?;
                let value = script.pop_front().ok_or_else(|| EvalError::HostCall {
                    name: name.to_string(),
                    detail: "sampler script exhausted".to_string(),
                })?;
                Ok(Some(Value::Float(value)))
            }
            _ => Err(EvalError::UnknownExternal {
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_rand_is_replayed_first() {
        let mut host = ScriptedHost::new().with_rand([7, 9]);
        let draw = |host: &mut ScriptedHost| {
            host.call("rand", &[], IrType::I32)
                .expect("rand")
                .and_then(|value| value.as_i64())
        };
        assert_eq!(draw(&mut host), Some(7));
        assert_eq!(draw(&mut host), Some(9));
        let fallback = draw(&mut host).expect("fallback value");
        assert!((0..=i64::from(RAND_MAX)).contains(&fallback));
    }

    #[test]
    fn srand_records_seed() {
        let mut host = ScriptedHost::new().with_clock(1_700_000_000);
        let now = host
            .call("time", &[Value::null()], IrType::I64)
            .expect("time");
        assert_eq!(now, Some(Value::i64(1_700_000_000)));
        host.call("srand", &[Value::i32(42)], IrType::Void)
            .expect("srand");
        assert_eq!(host.seeds(), &[42]);
    }

    #[test]
    fn samplers_replay_their_script() {
        let mut host = ScriptedHost::new().with_sampler("macke_sample", [0.25]);
        assert_eq!(
            host.call("macke_sample", &[], IrType::F64).expect("sample"),
            Some(Value::Float(0.25))
        );
        assert!(matches!(
            host.call("macke_sample", &[], IrType::F64),
            Err(EvalError::HostCall { .. })
        ));
        assert!(matches!(
            host.call("puts", &[], IrType::I32),
            Err(EvalError::UnknownExternal { .. })
        ));
    }
}
