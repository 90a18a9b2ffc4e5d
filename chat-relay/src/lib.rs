//! Relay server for two chat clients that ship without one.
//!
//! Terminal clients speak an unframed text protocol over TCP: the server
//! prompts with `NICK`, takes the next chunk as the nickname, and then relays
//! every chunk verbatim. Browser clients send JSON objects over a web socket.
//! Both kinds of session live in one registry, so chat crosses between them.
//!
//! - [`cli`] parses the command line into a [`relay::RelayConfig`].
//! - [`server`] binds both listeners and spawns a task per connection.
//! - [`transport`] holds the per-connection read and write loops.
//! - [`relay`] drives the handshake state machine and fans messages out.
//! - [`registry`] tracks live sessions behind a lock.
//! - [`session`] is per-connection state and its close signal.
//! - [`codec`] encodes and decodes both wire formats.
//! - [`message`] and [`history`] hold the protocol-independent chat types.

pub mod cli;
pub mod codec;
pub mod history;
pub mod message;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
