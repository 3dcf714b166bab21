pub mod client;
pub mod persistence;
pub mod protocol;
pub mod server;

pub use client::*;
pub use persistence::*;
pub use protocol::*;
pub use server::*;
