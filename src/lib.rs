#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![allow(missing_docs)]

mod cert;
pub use cert::{Certifier, TestResult};

mod config;
pub use config::{Config, params};

mod error;
pub use error::{Error, Result};

mod flags;
pub use flags::TrxFlags;

mod key;
pub use key::{Key, KeyAccess, KeyPart};

mod monitor;
pub use monitor::{
    ApplyOrder, CommitOrder, CommitPolicy, LocalOrder, Mode, Monitor, OrderPolicy,
};

mod pipeline;
pub use pipeline::Replicator;

mod provider;
pub use provider::{BufferId, EventHandler, Transport, View, WriteSetStore};

mod seqno;
pub use seqno::{Gtid, SEQNO_UNDEFINED, Seqno, SourceId};

mod service;

mod stats;
pub use stats::{MonitorStats, Stats};

mod trx;
pub use trx::{TrxGuard, TrxHandle, TrxState};

mod writeset;
pub use writeset::WriteSet;
