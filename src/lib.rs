//! Credit-based admission control for gRPC request/response services.
//!
//! A server wrapped in [`server::AdmissionLayer`] advertises a finite,
//! dynamically adjusted pool of credits to its clients. Each client, wrapped
//! in [`client::CreditGateLayer`], must hold one credit per outgoing request.
//! The server grows and shrinks its pool from a measured queueing-delay
//! signal (AIMD), while clients queue, expire stale requests, and piggyback
//! their current demand on ordinary request headers so the server can share
//! credits proportionally. There is no central coordinator and no side
//! channel: all control signals travel as metadata on the request/response
//! path.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
pub mod delay;
pub mod metadata;
pub mod server;


pub use client::{AdmitError, Admitter, CreditGate, CreditGateLayer};
pub use config::AdmissionConfig;
pub use delay::{DelayHistogram, DelaySignal, DelaySource, TimerLagProbe};
pub use server::{Admission, AdmissionLayer, Controller};
