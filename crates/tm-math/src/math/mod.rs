//! Numerical kernels used by the inference engines.

pub mod stable;
