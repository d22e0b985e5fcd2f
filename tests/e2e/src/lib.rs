//! End-to-end test support: a fully wired engine over a scratch database
//! plus a scripted LLM provider.

pub mod harness;
pub mod mocks;
