//! Common types, errors and parameter storage for compressed linear layers
//!
//! This crate provides the foundational pieces shared across the qlayer
//! workspace: the error taxonomy, the quantization scheme description,
//! lifecycle status, the named parameter store used for compressed storage,
//! and configuration loading.

pub mod config;
pub mod error;
pub mod tensor;
pub mod types;

pub use config::*;
pub use error::*;
pub use tensor::*;
pub use types::*;
