// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod backend_client;
mod builder;
mod system_client;

pub use backend_client::{BackendClient, TonicBackendClient};
pub use builder::ClientBuilder;
pub use system_client::{SystemClient, TonicSystemClient};

use async_trait::async_trait;
use protos::backend::v1::{AuthorizeRequest, AuthorizeResponse, GetPeerResponse, ReportRequest, ReportResponse};
use protos::system::v1::ProxyConfig as WireProxyConfig;

use crate::error::CoreError;

/// The three-field lookup key for a System configuration fetch (spec §4.4).
#[derive(Clone, Debug)]
pub struct SystemLookup {
    pub access_token: String,
    pub service_id: String,
    pub environment: String,
}

impl SystemLookup {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.access_token.is_empty() || self.service_id.is_empty() || self.environment.is_empty() {
            return Err(CoreError::InvalidArguments {
                message: "access_token, service_id and environment must all be non-empty".to_owned(),
            });
        }
        Ok(())
    }
}

/// Re-exported so callers of the trait objects below don't need to reach
/// into `protos` directly.
pub type WireAuthorizeRequest = AuthorizeRequest;
pub type WireAuthorizeResponse = AuthorizeResponse;
pub type WireReportRequest = ReportRequest;
pub type WireReportResponse = ReportResponse;
pub type WireGetPeerResponse = GetPeerResponse;
pub type WireProxyConfigDocument = WireProxyConfig;

#[async_trait]
pub trait SystemClientExt: SystemClient {
    async fn fetch(&self, lookup: &SystemLookup) -> Result<WireProxyConfigDocument, CoreError> {
        lookup.validate()?;
        self.fetch_latest_proxy_config(lookup).await
    }
}

impl<T: SystemClient + ?Sized> SystemClientExt for T {}
