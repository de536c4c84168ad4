#![forbid(unsafe_code)]
#![deny(future_incompatible)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    trivial_casts,
    unused_qualifications
)]

pub mod blobs;
pub mod config;
pub mod errors;
pub mod hosts;
pub mod intl;
pub mod manifests;
pub mod routetrie;
pub mod time;
pub mod tokens;
