//! Deterministic, pure logic shared by the executor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests. Model output only
//! ever reaches the rest of the crate through [`sanitizer`] and
//! [`diff_validator`].

pub mod diff_validator;
pub mod sanitizer;
pub mod transitions;
pub mod types;
