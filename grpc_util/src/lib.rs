// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod backend;
pub mod infra;
pub mod logging;
pub mod retry;
pub mod sentry;
