//! Sandboxed execution of guild-authored Discord interaction scripts.
//!
//! Scripts are compiled once by a [`sandbox::ScriptRuntime`] and run per
//! interaction by a [`dispatch::Dispatcher`]. A run sees only the
//! capability namespaces the host binds for it and is metered in steps and
//! compute time.

pub mod capabilities;
pub mod config;
pub mod discord;
pub mod dispatch;
pub mod kv;
pub mod sandbox;
pub mod values;
