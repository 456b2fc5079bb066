#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Leaf types shared across the `attestor` workspace: candidate records,
//! proxy endpoint specs, and the operator contact configuration.

pub mod contact;
pub mod proxy;
pub mod record;
