//! Palaver is a multi-user chat server reachable over a local stream
//! socket. Clients register a nickname, exchange text and file messages
//! point-to-point or by broadcast, and pick up missed messages from a
//! bounded per-user history.
//!
//! The crate is organized around the dispatch runtime in [`server`]: a
//! readiness poll feeds ready descriptors through a blocking queue to a
//! pool of workers, which parse one frame each and run the matching
//! handler in [`ops`] against the shared [`directory`].

pub mod config;
pub mod directory;
pub mod history;
pub mod logging;
pub mod net;
pub mod ops;
pub mod queue;
pub mod server;
pub mod stats;
pub mod table;
