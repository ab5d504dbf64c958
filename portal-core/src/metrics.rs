#![allow(missing_docs)]

//! # metrics
//!
//! contains statistics for relay metrics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// When the relay started
    pub static ref START_TIME: Instant = Instant::now();

    /// seconds since start
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "uptime (seconds)").unwrap();

    /// currently registered leases
    pub static ref ACTIVE_LEASES: IntGauge =
        register_int_gauge!("active_leases", "active leases").unwrap();
    /// reverse sessions currently attached
    pub static ref REVERSE_SESSIONS: IntGauge =
        register_int_gauge!("reverse_sessions", "attached reverse sessions").unwrap();
    /// in-flight bridged connections (SNI + HTTP)
    pub static ref LIVE_BRIDGES: IntGauge =
        register_int_gauge!("live_bridges", "in-flight bridged connections").unwrap();

    /// lease registrations accepted
    pub static ref REGISTRATIONS: IntCounter =
        register_int_counter!("registrations", "lease registrations accepted").unwrap();
    /// lease renewals accepted
    pub static ref RENEWALS: IntCounter =
        register_int_counter!("renewals", "lease renewals accepted").unwrap();
    /// leases reaped by the expirer
    pub static ref EXPIRED_LEASES: IntCounter =
        register_int_counter!("expired_leases", "leases reaped by the expirer").unwrap();

    /// TCP connections accepted by the SNI front door
    pub static ref SNI_CONNECTIONS: IntCounter =
        register_int_counter!("sni_connections", "connections accepted on the SNI front door")
            .unwrap();
    /// front door rejects by reason
    pub static ref SNI_REJECTED: IntCounterVec = register_int_counter_vec!(
        "sni_rejected",
        "front door rejects",
        &["reason"]
    )
    .unwrap();
    /// requests forwarded by the HTTP subdomain proxy
    pub static ref PROXIED_REQUESTS: IntCounter =
        register_int_counter!("proxied_requests", "requests forwarded by the subdomain proxy")
            .unwrap();
    /// sub-stream acquisitions that timed out
    pub static ref ACQUIRE_TIMEOUTS: IntCounter =
        register_int_counter!("acquire_timeouts", "sub-stream acquisitions that timed out")
            .unwrap();
    /// total bytes moved across bridges, both directions
    pub static ref BRIDGED_BYTES: IntCounter =
        register_int_counter!("bridged_bytes", "bytes moved across bridges").unwrap();
}
