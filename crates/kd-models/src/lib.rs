//! KuberDock Records
//!
//! Strongly typed records shared by the KuberDock core crates: pods and their
//! configuration, users and their suspension state, and the IP pool tables.

pub mod ids;
pub mod network;
pub mod pod;
pub mod user;

pub use ids::*;
pub use network::*;
pub use pod::*;
pub use user::*;
