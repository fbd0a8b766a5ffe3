//! # sigscope
//!
//! Core runtime of an SDR spectrum analyzer: pluggable complex-baseband
//! sources, a two-tier worker scheduler, per-client sub-band inspectors,
//! a PSD engine, and the CBOR/superframe wire plumbing behind the remote
//! device server and its multicast fan-out.
//!
//! The entry point for local use is [`analyzer::Analyzer`]; for remote
//! use, [`server::AnalyzerServer`] on one end and
//! [`remote::client::RemoteClient`] on the other.

pub mod analyzer;
pub mod buffer;
pub mod cbor;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod inspector;
pub mod message;
pub mod mq;
pub mod multicast;
pub mod npy;
pub mod psd;
pub mod remote;
pub mod server;
pub mod source;
pub mod strmap;
pub mod worker;

pub use crate::{
    analyzer::{
        Analyzer,
        AnalyzerParams,
    },
    message::{
        Message,
        MessageKind,
    },
    mq::MessageQueue,
    source::{
        Permissions,
        SourceConfig,
        SourceInfo,
        SourceType,
    },
};

/// Process-lifetime registry of pluggable classes. Built once at program
/// start, before any worker thread exists; registration afterwards is
/// not supported.
pub struct Registry {
    pub codecs: codec::CodecRegistry,
}

impl Registry {
    pub fn with_builtins() -> Self {
        Self {
            codecs: codec::CodecRegistry::with_builtins(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
