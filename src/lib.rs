// Copyright (c) 2025 signal-client Contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # signal-client
//!
//! An async Rust client library implementing the Signal protocol double ratchet
//! over a relay-based messaging service, with an external directory/auth service
//! ("Atlas") consumed through a narrow trait boundary.

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod outgoing;
pub mod payload;
pub mod provisioning;
pub mod proto;
pub mod receiver;
pub mod registration;
pub mod sender;
pub mod signal;
pub mod store;
pub mod tag;
pub mod util;
pub mod ws;

pub use address::Address;
pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
