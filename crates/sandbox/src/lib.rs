//! Sandbox abstraction: the line-delimited JSON channel, provider variants,
//! and the manager that owns live handles.

pub mod channel;
pub mod extensions;
pub mod log_ring;
pub mod manager;
pub mod providers;

pub use channel::{AgentEnd, Inbound, SandboxChannel};
pub use log_ring::LogRing;
pub use manager::{SandboxManager, SessionDirs};
pub use providers::{
    CreateSandboxOptions, SandboxDescription, SandboxHandle, SandboxStatus,
};
