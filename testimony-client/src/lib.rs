//! Reference client library for Testimony (§4.5, §6.4): a safe Rust API
//! plus the C ABI wrapping it for non-Rust consumers.

pub mod client;
mod fdpass;
pub mod ffi;

pub use client::{Block, Client};
pub use testimony_wire::{ClientErrorKind, ClientResult};
