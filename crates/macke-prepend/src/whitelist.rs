//! Object names a vector may carry without a matching parameter.
//!
//! KLEE's POSIX runtime and the macke drivers add bookkeeping objects (the
//! symbolic file system, stdin, argv) that never correspond to arguments of
//! the function under test.

pub const EXEMPT_PREFIX: &str = "macke_";

pub const EXEMPT_NAMES: &[&str] = &[
    "model_version",
    "A-data",
    "A-data-stat",
    "B-data",
    "B-data-stat",
    "C-data",
    "C-data-stat",
    "stdin",
    "stdin-stat",
    "macke_noname",
    "argv",
];

pub fn is_exempt(name: &str) -> bool {
    name.starts_with(EXEMPT_PREFIX) || EXEMPT_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_objects_are_exempt() {
        for name in EXEMPT_NAMES {
            assert!(is_exempt(name), "{name} should be exempt");
        }
        assert!(is_exempt("macke_sym_arg_0"));
    }

    #[test]
    fn argument_names_are_not_exempt() {
        for name in ["x", "buf", "mack_x", "stdin2", "Argv", "A-data-stats"] {
            assert!(!is_exempt(name), "{name} should bind to a parameter");
        }
    }
}
