//! Core types and constants for the sinktree protocol
//!
//! This module contains the fundamental building blocks used throughout the
//! library: node addressing, protocol state, cluster/routing bookkeeping,
//! clocks and runtime tunables.

pub mod error;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{
    Clock,
    ClusterState,
    NeighborRecord,
    NodeAddress,
    ProtocolState,
    SystemClock,
    Tunables,
};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Radio protocol number for routing/clustering control frames
pub const PROTO_CONTROL: u8 = 0x21;

/// Radio protocol number for time-sync frames
pub const PROTO_TIMESYNC: u8 = 0x22;

/// Radio protocol number for application data envelopes
pub const PROTO_DATA: u8 = 0x23;

/// Maximum radio frame size in bytes; larger frames are fragmented
pub const MAX_FRAME_SIZE: usize = 1024;

/// HEED head-probability scaling constant
pub const HEED_C: f64 = 0.10;

/// HEED minimum head probability
pub const HEED_P_MIN: f64 = 1e-4;

/// HEED maximum residual energy reference
pub const HEED_E_MAX: f64 = 100.0;

/// Consecutive send failures after which a neighbor is evicted immediately
pub const MAX_NUM_FAILS: u32 = 7;

/// Number of recent payload hashes kept for duplicate suppression
pub const DEDUP_RING_SIZE: usize = 10;

/// Unicast retry budget for single-frame sends
pub const SEND_RETRIES: u32 = 3;

/// Unicast retry budget per fragment on the fragmented path
pub const SEND_RETRIES_FRAGMENTED: u32 = 4;

/// Minimum signal strength for accepting a head claim
pub const MIN_CLAIM_RSSI: i16 = -90;

/// Window within which repeated forced-reroute triggers are ignored
pub const REROUTE_SUPPRESSION_MS: u64 = 5_000;

/// Default liveness sweep period
pub const DEFAULT_MONITOR_SLEEP_MS: u64 = 30_000;

/// Default period between sink-driven forced re-routes
pub const DEFAULT_REROUTE_EPOCH_MS: u64 = 600_000;

/// Default period between sink-driven time syncs (15 minutes)
pub const DEFAULT_SYNC_EPOCH_MS: u64 = 900_000;

/// Default intra-cluster transmit power
pub const DEFAULT_POWER_INTRA: u8 = 16;

/// Default inter-cluster transmit power
pub const DEFAULT_POWER_INTER: u8 = 32;
