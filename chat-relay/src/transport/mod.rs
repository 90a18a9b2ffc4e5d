//! Per-connection I/O for each wire protocol.
//!
//! Both transports follow the same shape: a read loop on the connection task
//! feeding [`crate::relay::Relay::on_inbound`], and a spawned writer task that
//! drains the session's outbound queue until the queue closes or the session's
//! close signal fires.

pub mod raw;
pub mod web;
