//! Machine-code backends.

pub mod x64;
