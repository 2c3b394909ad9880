//! # codepipe
//!
//! Drive code execution, object manipulation, and ad-hoc byte streams
//! inside a separate, long-running remote process over a single TCP
//! control channel.
//!
//! The wire protocol is four cooperating sub-protocols on one socket:
//!
//! - a length-prefixed JSON request/notification/response envelope
//! - a live-output relay interleaved with a pending call's responses
//! - a remote object-proxy protocol against server-resident handles
//! - two bytestream sub-protocols: bulk file transfer and custom
//!   communicator channel handoff
//!
//! ## Example
//!
//! ```ignore
//! use codepipe::network::{Endpoint, PipeClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), codepipe::network::ClientError> {
//!     let client = PipeClient::new(Endpoint::default());
//!     println!("{}", client.banner().await?);
//!     client.exec("print(\"hello from the far side\")").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod executor;
pub mod network;
pub mod protocol;
pub mod proxy;

pub use network::{ClientError, Endpoint, PipeClient, PipeServer};
pub use proxy::{Attr, ClassProxy, FuncProxy, InstanceProxy};
