// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use grpc_util::backend::BackendConfig;
use grpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;
use sidecar_core::config::Config as CoreConfig;

/// Top-level configuration file, the way `proxy_server::config::Config`
/// wraps `proxy`'s own config alongside the infra/listen/grpc concerns that
/// are the binary's job, not the library's.
#[derive(Deserialize, Debug)]
pub struct Config {
    /// Address of the remote System configuration service.
    pub system_endpoint: BackendConfig,

    /// Address of the remote Backend accounting service.
    pub backend_endpoint: BackendConfig,

    /// IP:PORT this sidecar's own inbound service listens on.
    pub listen_addr: String,

    /// Tuning for the two caches and their background workers.
    #[serde(default)]
    pub core: CoreConfig,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration for the inbound server.
    pub grpc: Option<GrpcConfig>,
}

impl Config {
    pub fn from_str(raw_config: &str) -> Result<Config, String> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let yaml = "\
system_endpoint:
  address: system:8980
backend_endpoint:
  address: backend:8981
listen_addr: 0.0.0.0:9000
";
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.system_endpoint.address, "system:8980");
        assert_eq!(config.backend_endpoint.address, "backend:8981");
        assert_eq!(config.core.system_cache_ttl_s, 300);
    }
}
