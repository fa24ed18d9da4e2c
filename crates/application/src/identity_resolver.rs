use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, warn};

use domain::error::ProxyError;
use domain::identity::entity::{ResolvedIdentity, SarTemplate};
use ports::secondary::control_plane::ControlPlane;

/// Resolves a bearer token into a full identity by querying the control
/// plane: token review, one SAR per configured backend role, and the
/// caller's project listing.
///
/// Used as the loader behind [`crate::identity_cache::IdentityCache`]; it
/// holds no per-request state and is safe for concurrent use.
pub struct IdentityResolver {
    control_plane: Arc<dyn ControlPlane>,
    backend_roles: BTreeMap<String, SarTemplate>,
}

impl IdentityResolver {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        backend_roles: BTreeMap<String, SarTemplate>,
    ) -> Self {
        Self {
            control_plane,
            backend_roles,
        }
    }

    /// Resolve `token` against the control plane.
    ///
    /// Token-review and project-listing failures abort the resolution. A SAR
    /// transport failure only skips that role: a flaky authorization endpoint
    /// degrades to fewer roles granted, not a refused request.
    pub async fn resolve(&self, token: &str) -> Result<ResolvedIdentity, ProxyError> {
        let review = self.control_plane.token_review(token).await.map_err(|e| {
            error!(error = %e, "token review failed");
            ProxyError::from(e)
        })?;

        if !review.authenticated {
            return Err(ProxyError::Unauthenticated {
                message: review.error_message.clone(),
            });
        }
        debug!(username = %review.username, groups = ?review.groups, "token review succeeded");

        let mut roles = BTreeSet::new();
        for (name, sar) in &self.backend_roles {
            match self
                .control_plane
                .subject_access_review(&review.username, &review.groups, sar)
                .await
            {
                Ok(true) => {
                    debug!(role = %name, user = %review.username, "SAR allowed");
                    roles.insert(name.clone());
                }
                Ok(false) => {
                    debug!(role = %name, user = %review.username, "SAR denied");
                }
                Err(e) => {
                    warn!(
                        role = %name,
                        user = %review.username,
                        error = %e,
                        "unable to evaluate SAR, role skipped"
                    );
                }
            }
        }

        let projects = self.control_plane.list_projects(token).await.map_err(|e| {
            error!(error = %e, "project listing failed");
            ProxyError::from(e)
        })?;

        Ok(ResolvedIdentity {
            review,
            roles,
            projects,
        })
    }
}
