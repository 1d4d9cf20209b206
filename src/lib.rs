//! Client-edge caching interceptor.
//!
//! Every outbound request is classified by an ordered route table and
//! served by one of four strategies backed by versioned buckets. When both
//! cache and network fail the request still gets an offline response.
//! Events recorded while offline wait in a durable queue until a sync
//! signal flushes them.

pub mod cache;
pub mod config;
pub mod event;
pub mod fallback;
pub mod host;
pub mod lifecycle;
pub mod network;
pub mod push;
pub mod queue;
pub mod router;
pub mod tasks;
pub mod worker;

#[cfg(test)]
mod testing;
