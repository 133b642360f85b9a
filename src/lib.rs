//! Control core for BM13xx-based Bitcoin mining devices.
//!
//! The crate turns pool work templates into chip jobs, drives the hash
//! chain over a serial link, scores returned nonces and submits the ones
//! that clear the pool difficulty. Transport and pool session setup stay
//! outside; everything here works against `AsyncRead`/`AsyncWrite` halves
//! and a narrow pool seam.

pub mod asic;
pub mod config;
pub mod daemon;
pub mod monitor;
pub mod pool;
pub mod tasks;
pub mod tracing;
pub mod work;
