pub mod auth;
pub mod client;
pub mod services;

pub use auth::{AuthManager, AuthToken};
pub use client::{Client, Transport};
pub use services::{Hypervisor, NetworkSpec, Server, ServerSpec, SubnetLayout};
