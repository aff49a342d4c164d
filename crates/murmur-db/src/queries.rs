//! Database query functions.

pub mod kv;
