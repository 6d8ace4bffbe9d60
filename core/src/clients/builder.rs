// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use grpc_util::backend::{construct_channel, BackendConfig};

use crate::clients::{BackendClient, SystemClient, TonicBackendClient, TonicSystemClient};

/// Constructs the two client adapters from an `ADDRESS:PORT` plus the
/// connection count to maintain, sharing one HTTP transport between every
/// client built from the same `ClientBuilder` (spec §2, "Client builder").
pub struct ClientBuilder {
    config: BackendConfig,
}

impl ClientBuilder {
    pub fn new(address: String, connections: usize) -> Self {
        ClientBuilder {
            config: BackendConfig { address, connections },
        }
    }

    pub async fn build_system_client(&self) -> Result<Arc<dyn SystemClient>, String> {
        let channel = construct_channel(BackendConfig {
            address: self.config.address.clone(),
            connections: self.config.connections,
        })
        .await?;
        Ok(Arc::new(TonicSystemClient::new(channel)))
    }

    pub async fn build_backend_client(&self) -> Result<Arc<dyn BackendClient>, String> {
        let channel = construct_channel(BackendConfig {
            address: self.config.address.clone(),
            connections: self.config.connections,
        })
        .await?;
        Ok(Arc::new(TonicBackendClient::new(channel)))
    }
}
