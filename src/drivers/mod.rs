//! Drivers shipped with the crate.

pub mod demo;
pub mod fx2lafw;
pub mod ols;
pub mod session_file;
