//! # murmur-shared
//!
//! Types shared between the murmur store and server: identifiers, the
//! realtime wire protocol, populated API views and signed auth tokens.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;
