// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use ginepro::LoadBalancedChannel;
use protos::system::v1::system_config_service_client::SystemConfigServiceClient;
use protos::system::v1::{FetchLatestProxyConfigRequest, ProxyConfig as WireProxyConfig};
use tonic::metadata::MetadataValue;
use tonic::Request;
use tracing::instrument;

use crate::clients::SystemLookup;
use crate::error::{CoreError, NetworkErrorKind};

/// Thin contract over remote System: fetch the latest proxy configuration
/// for a (service, environment) pair (spec §2, §6).
#[async_trait]
pub trait SystemClient: Send + Sync {
    async fn fetch_latest_proxy_config(&self, lookup: &SystemLookup) -> Result<WireProxyConfig, CoreError>;
}

/// `SystemClient` backed by the generated tonic client.
pub struct TonicSystemClient {
    inner: SystemConfigServiceClient<LoadBalancedChannel>,
}

impl TonicSystemClient {
    pub fn new(channel: LoadBalancedChannel) -> Self {
        TonicSystemClient {
            inner: SystemConfigServiceClient::new(channel),
        }
    }
}

#[async_trait]
impl SystemClient for TonicSystemClient {
    #[instrument(skip(self), fields(service_id = %lookup.service_id))]
    async fn fetch_latest_proxy_config(&self, lookup: &SystemLookup) -> Result<WireProxyConfig, CoreError> {
        let mut request = Request::new(FetchLatestProxyConfigRequest {
            service_id: lookup.service_id.clone(),
            environment: lookup.environment.clone(),
        });
        let bearer = format!("Bearer {}", lookup.access_token);
        let value = MetadataValue::try_from(bearer.as_str())
            .map_err(|err| CoreError::InvalidArguments { message: err.to_string() })?;
        request.metadata_mut().insert("authorization", value);

        let mut client = self.inner.clone();
        let response = client.fetch_latest_proxy_config(request).await.map_err(|status| {
            CoreError::RemoteUnavailable {
                message: status.message().to_owned(),
                kind: NetworkErrorKind::classify(&status),
            }
        })?;
        response
            .into_inner()
            .config
            .ok_or_else(|| CoreError::ServiceConfigUnavailable {
                service_id: lookup.service_id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_in_response_is_an_error() {
        // `config` is `optional` on the wire; a well-formed but empty
        // response must not panic the decode path.
        let response = protos::system::v1::FetchLatestProxyConfigResponse { config: None };
        assert!(response.config.is_none());
    }
}
