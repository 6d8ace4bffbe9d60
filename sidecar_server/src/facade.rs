// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Minimal inbound request handling: credential extraction plus proxy-rule
//! matching, delegating everything else to `AuthorizationManager`. The
//! actual gRPC/HTTP service that calls into this is an external
//! collaborator (spec §1 Non-goals) - no token/JWT verification happens
//! here, and no wire protocol is defined by this crate.

use std::collections::HashMap;
use std::sync::Arc;

use protos::backend::v1::{AuthorizeRequest, Transaction};
use sidecar_core::backend_engine::AuthorizeOutcome;
use sidecar_core::clients::SystemLookup;
use sidecar_core::error::CoreError;
use sidecar_core::manager::AuthorizationManager;
use sidecar_core::model::{AuthPattern, ProxyConfig};
use sidecar_core::policy::match_metrics;

/// Everything about an inbound request that has already been extracted by
/// the actual gRPC façade before calling in here: the matched service's
/// identity, the request line, and whatever credential material each
/// `AuthPattern` needs. `claims` holds upstream-verified OIDC claims keyed
/// by claim name - this crate never verifies a token itself.
#[allow(dead_code)]
pub struct RequestContext {
    pub access_token: String,
    pub service_id: String,
    pub environment: String,
    pub http_method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub claims: HashMap<String, String>,
}

/// Thin wrapper over `AuthorizationManager` implementing the credential
/// extraction and rule matching described in spec §6 Inbound.
pub struct AuthzService {
    manager: Arc<AuthorizationManager>,
}

impl AuthzService {
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        AuthzService { manager }
    }

    /// Not yet called from this binary's `main` - the actual gRPC/HTTP
    /// binding that would invoke this per inbound request is an external
    /// collaborator's responsibility (spec §1 Non-goals).
    #[allow(dead_code)]
    pub async fn authorize_request(&self, context: &RequestContext) -> Result<AuthorizeOutcome, CoreError> {
        let lookup = SystemLookup {
            access_token: context.access_token.clone(),
            service_id: context.service_id.clone(),
            environment: context.environment.clone(),
        };
        let config = self.manager.authorize(&lookup).await?;

        let metrics = match_metrics(&config.rules, &context.http_method, &context.path);
        if metrics.is_empty() {
            return Err(CoreError::NoMatchingRule);
        }

        let params = extract_identity(&config, context)?;

        let request = AuthorizeRequest {
            service_id: context.service_id.clone(),
            auth_type: config.backend_auth_type.clone(),
            auth_value: config.backend_auth_value.clone(),
            transactions: vec![Transaction {
                metrics,
                params,
                timestamp: None,
            }],
            extend_hierarchy: false,
        };
        self.manager.auth_rep(request).await
    }
}

/// Pick the identifier source `config.auth_pattern` names. `ApiKey` reads
/// `user_key`, `AppIdKey` reads `app_id`/`app_key`, both from query params;
/// `OpenId` reads the configured claim from the already-verified claim set.
fn extract_identity(config: &ProxyConfig, context: &RequestContext) -> Result<HashMap<String, String>, CoreError> {
    let mut params = HashMap::new();
    match config.auth_pattern {
        AuthPattern::ApiKey => {
            let user_key = context.query_params.get("user_key").ok_or(CoreError::MissingCredentials)?;
            params.insert("user_key".to_owned(), user_key.clone());
        }
        AuthPattern::AppIdKey => {
            let app_id = context.query_params.get("app_id").ok_or(CoreError::MissingCredentials)?;
            let app_key = context.query_params.get("app_key").ok_or(CoreError::MissingCredentials)?;
            params.insert("app_id".to_owned(), app_id.clone());
            params.insert("app_key".to_owned(), app_key.clone());
        }
        AuthPattern::OpenId => {
            let claim = context.claims.get(config.openid_claim()).ok_or(CoreError::MissingCredentials)?;
            params.insert(config.openid_claim().to_owned(), claim.clone());
        }
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecar_core::model::{Hierarchy, ProxyRule};

    fn config_with(auth_pattern: AuthPattern) -> ProxyConfig {
        ProxyConfig::new(
            "backend:3000".to_owned(),
            auth_pattern,
            "user_key".to_owned(),
            "secret".to_owned(),
            vec![ProxyRule {
                http_method: "GET".to_owned(),
                path_pattern: "/widgets/{id}".to_owned(),
                metric_name: "hits".to_owned(),
                delta: 1,
                position: 0,
                last: true,
            }],
            Hierarchy::default(),
            None,
        )
    }

    fn context() -> RequestContext {
        RequestContext {
            access_token: "token".to_owned(),
            service_id: "svc".to_owned(),
            environment: "production".to_owned(),
            http_method: "GET".to_owned(),
            path: "/widgets/42".to_owned(),
            query_params: HashMap::new(),
            claims: HashMap::new(),
        }
    }

    #[test]
    fn api_key_extraction_requires_user_key() {
        let config = config_with(AuthPattern::ApiKey);
        let context = context();
        assert!(matches!(extract_identity(&config, &context), Err(CoreError::MissingCredentials)));
    }

    #[test]
    fn api_key_extraction_succeeds_with_user_key() {
        let config = config_with(AuthPattern::ApiKey);
        let mut context = context();
        context.query_params.insert("user_key".to_owned(), "abc123".to_owned());
        let params = extract_identity(&config, &context).unwrap();
        assert_eq!(params.get("user_key"), Some(&"abc123".to_owned()));
    }

    #[test]
    fn app_id_key_extraction_requires_both_fields() {
        let config = config_with(AuthPattern::AppIdKey);
        let mut context = context();
        context.query_params.insert("app_id".to_owned(), "app-1".to_owned());
        assert!(matches!(extract_identity(&config, &context), Err(CoreError::MissingCredentials)));
        context.query_params.insert("app_key".to_owned(), "key-1".to_owned());
        let params = extract_identity(&config, &context).unwrap();
        assert_eq!(params.get("app_id"), Some(&"app-1".to_owned()));
        assert_eq!(params.get("app_key"), Some(&"key-1".to_owned()));
    }

    #[test]
    fn openid_extraction_reads_configured_claim() {
        let mut config = config_with(AuthPattern::OpenId);
        config.openid_client_id_claim = Some("azp".to_owned());
        let mut context = context();
        context.claims.insert("azp".to_owned(), "client-xyz".to_owned());
        let params = extract_identity(&config, &context).unwrap();
        assert_eq!(params.get("azp"), Some(&"client-xyz".to_owned()));
    }
}
