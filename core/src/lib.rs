// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod application;
pub mod backend_cache;
pub mod backend_engine;
pub mod clients;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod policy;
pub mod system_cache;
pub mod telemetry;
mod wire;

pub use error::CoreError;
pub use manager::AuthorizationManager;
