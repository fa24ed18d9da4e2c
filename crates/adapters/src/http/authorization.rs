use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Request};
use tracing::{debug, trace};

use application::identity_cache::IdentityCache;
use domain::error::ProxyError;
use domain::identity::entity::RequestIdentity;
use domain::identity::roles::effective_roles;

use super::pipeline::RequestHandler;
use super::tls::{PeerSubject, TlsConnectInfo};

pub const HEADER_FORWARDED_USER: &str = "x-forwarded-user";
pub const HEADER_FORWARDED_ROLES: &str = "x-forwarded-roles";
pub const HEADER_FORWARDED_NAMESPACE: &str = "x-ocp-ns";
pub const HEADER_FORWARDED_NAMESPACE_UID: &str = "x-ocp-nsuid";
pub const HEADER_FORWARDED_ACCESS_TOKEN: &str = "x-forwarded-access-token";
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

/// The mandatory pipeline stage: resolves the caller's identity from a
/// bearer token or client certificate, strips every inbound copy of the
/// trusted headers, and writes the proxy's own values.
pub struct AuthorizationHandler {
    cache: Arc<IdentityCache>,
    configured_roles: Vec<String>,
    admin_role: Option<String>,
    default_role: Option<String>,
    whitelisted_names: Vec<String>,
}

impl AuthorizationHandler {
    pub fn new(
        cache: Arc<IdentityCache>,
        configured_roles: Vec<String>,
        admin_role: Option<String>,
        default_role: Option<String>,
        whitelisted_names: Vec<String>,
    ) -> Self {
        Self {
            cache,
            configured_roles,
            admin_role,
            default_role,
            whitelisted_names,
        }
    }

    fn is_whitelisted(&self, subject: &PeerSubject) -> bool {
        self.whitelisted_names.iter().any(|name| {
            subject.common_name.as_deref() == Some(name.as_str()) || *name == subject.rfc2253
        })
    }

    async fn process_token(
        &self,
        mut req: Request<Body>,
        token: String,
    ) -> Result<Request<Body>, ProxyError> {
        let identity = self.cache.get(&token).await?;

        let username = identity.review.username.clone();
        if username.is_empty() {
            trace!("bearer token resolved to no username");
            return Err(ProxyError::IdentityUnresolved);
        }

        let roles = effective_roles(
            &identity.roles,
            self.configured_roles.iter().map(String::as_str),
            self.default_role.as_deref(),
            self.admin_role.as_deref(),
        );
        if let Some(admin) = &self.admin_role
            && roles.contains(admin)
        {
            debug!(admin_role = %admin, "caller holds the admin role, all other roles dropped");
        }

        let headers = req.headers_mut();
        headers.insert(HEADER_FORWARDED_USER, header_value(&username)?);
        headers.insert(
            HEADER_FORWARDED_ROLES,
            header_value(&roles.iter().cloned().collect::<Vec<_>>().join(","))?,
        );

        if !identity.projects.is_empty() {
            let names = identity
                .projects
                .iter()
                .map(|p| format!("{:?}", p.name))
                .collect::<Vec<_>>()
                .join(",");
            let uids = identity
                .projects
                .iter()
                .map(|p| p.uuid.clone())
                .collect::<Vec<_>>()
                .join(",");
            headers.insert(HEADER_FORWARDED_NAMESPACE, header_value(&names)?);
            headers.insert(HEADER_FORWARDED_NAMESPACE_UID, header_value(&uids)?);
        }
        headers.append(HEADER_FORWARDED_FOR, HeaderValue::from_static("localhost"));

        req.extensions_mut().insert(RequestIdentity {
            username,
            subject: None,
            projects: identity.projects.clone(),
            roles: roles.into_iter().collect(),
        });
        Ok(req)
    }

    fn process_certificate(
        &self,
        mut req: Request<Body>,
        subject: Option<PeerSubject>,
    ) -> Result<Request<Body>, ProxyError> {
        let subject = subject
            .map(|s| s.rfc2253)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ProxyError::IdentityUnresolved)?;

        let headers = req.headers_mut();
        headers.insert(HEADER_FORWARDED_USER, header_value(&subject)?);
        headers.append(HEADER_FORWARDED_FOR, HeaderValue::from_static("localhost"));

        req.extensions_mut().insert(RequestIdentity {
            username: subject.clone(),
            subject: Some(subject),
            projects: Vec::new(),
            roles: Vec::new(),
        });
        Ok(req)
    }
}

#[async_trait]
impl RequestHandler for AuthorizationHandler {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn process(&self, mut req: Request<Body>) -> Result<Request<Body>, ProxyError> {
        let peer_subject = req
            .extensions()
            .get::<ConnectInfo<TlsConnectInfo>>()
            .and_then(|info| info.0.peer_subject.clone());

        // Whitelisted certificate subjects bypass the proxy entirely, before
        // any header is touched.
        if let Some(subject) = &peer_subject
            && self.is_whitelisted(subject)
        {
            trace!("whitelisted certificate subject, passing request through");
            return Ok(req);
        }

        let token = bearer_token(&req);
        sanitize_headers(&mut req);

        match token {
            Some(token) => self.process_token(req, token).await,
            None => self.process_certificate(req, peer_subject),
        }
    }
}

/// Remove every inbound copy of the credential and trusted headers.
fn sanitize_headers(req: &mut Request<Body>) {
    let headers = req.headers_mut();
    headers.remove(AUTHORIZATION);
    headers.remove(HEADER_FORWARDED_ACCESS_TOKEN);
    headers.remove(HEADER_FORWARDED_USER);
    headers.remove(HEADER_FORWARDED_ROLES);
    headers.remove(HEADER_FORWARDED_NAMESPACE);
    headers.remove(HEADER_FORWARDED_NAMESPACE_UID);
}

/// Extract the bearer credential: the forwarded-access-token header wins,
/// then the `Bearer` scheme of `Authorization`. Whitespace-only values and
/// other schemes count as no token.
fn bearer_token(req: &Request<Body>) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(HEADER_FORWARDED_ACCESS_TOKEN)
        .and_then(|v| v.to_str().ok())
    {
        let token = value.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let (scheme, rest) = authorization.split_once(' ')?;
    if scheme != "Bearer" {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|_| ProxyError::Internal {
        message: format!("value for trusted header is not header-safe: {value:?}"),
    })
}
