// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use ginepro::LoadBalancedChannel;
use protos::backend::v1::backend_service_client::BackendServiceClient;
use protos::backend::v1::{AuthorizeRequest, AuthorizeResponse, GetPeerRequest, GetPeerResponse, ReportRequest, ReportResponse};
use tonic::Request;
use tracing::instrument;

use crate::error::{CoreError, NetworkErrorKind};

/// Thin contract over remote Backend: authorize (no counting), auth-rep
/// (authorize then count), report (count only), and peer discovery
/// (spec §2, §6).
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, CoreError>;
    async fn auth_rep(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, CoreError>;
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, CoreError>;
    async fn get_peer(&self, service_id: String) -> Result<GetPeerResponse, CoreError>;
}

/// `BackendClient` backed by the generated tonic client.
pub struct TonicBackendClient {
    inner: BackendServiceClient<LoadBalancedChannel>,
}

impl TonicBackendClient {
    pub fn new(channel: LoadBalancedChannel) -> Self {
        TonicBackendClient {
            inner: BackendServiceClient::new(channel),
        }
    }

    fn classify(status: tonic::Status) -> CoreError {
        CoreError::RemoteUnavailable {
            message: status.message().to_owned(),
            kind: NetworkErrorKind::classify(&status),
        }
    }
}

#[async_trait]
impl BackendClient for TonicBackendClient {
    #[instrument(skip(self, request), fields(service_id = %request.service_id))]
    async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, CoreError> {
        let mut client = self.inner.clone();
        client
            .authorize(Request::new(request))
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }

    #[instrument(skip(self, request), fields(service_id = %request.service_id))]
    async fn auth_rep(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, CoreError> {
        let mut client = self.inner.clone();
        client
            .auth_rep(Request::new(request))
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }

    #[instrument(skip(self, request), fields(service_id = %request.service_id))]
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, CoreError> {
        let mut client = self.inner.clone();
        client
            .report(Request::new(request))
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }

    async fn get_peer(&self, service_id: String) -> Result<GetPeerResponse, CoreError> {
        let mut client = self.inner.clone();
        client
            .get_peer(Request::new(GetPeerRequest { service_id }))
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }
}
