//! tapebridge
//!
//! Protocol bridge between the legacy tape-daemon wire protocol and the
//! message-object gateway protocol. One engine instance drives one mount
//! session end to end.

pub mod catalogue;
pub mod cli;
pub mod client_net;
pub mod client_proto;
pub mod codec;
pub mod engine;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod tape_net;
