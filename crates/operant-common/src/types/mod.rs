//! Core value types

pub mod action;
pub mod diagnostics;
