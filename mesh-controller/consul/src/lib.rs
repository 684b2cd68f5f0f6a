#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A [`ServiceRegistry`](ovs_mesh_controller_core::ServiceRegistry) backed by the local Consul
//! agent's HTTP API.

mod client;
mod wire;

pub use self::client::{ClientError, ConsulRegistry, TOKEN_HEADER};
pub use reqwest::Url;
