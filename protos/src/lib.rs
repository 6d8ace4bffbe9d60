// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::doc_lazy_continuation)]

pub mod system {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/system.v1.rs"));
    }
}

pub mod backend {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/backend.v1.rs"));
    }
}

#[cfg(test)]
mod tests;
