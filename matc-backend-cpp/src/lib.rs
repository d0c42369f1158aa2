#![forbid(unsafe_code)]

mod emit;

pub use emit::{
    compute_predicates, emit_program, CppArtifacts, CppBackendError, EmitOptions, Predicates,
};
