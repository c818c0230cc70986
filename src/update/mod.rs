//! Update construction and broadcast

pub mod builder;

pub use builder::{BuildError, UpdateBuilder, CHANGE_VOUT, REFUND_VOUT};
