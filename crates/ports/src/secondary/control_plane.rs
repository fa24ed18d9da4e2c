use async_trait::async_trait;
use domain::error::ControlPlaneError;
use domain::identity::entity::{Project, SarTemplate, TokenReviewOutcome};

/// Secondary port for the Kubernetes-style control plane.
///
/// Implementations are stateless and safe for concurrent use; every method
/// may be called from many request tasks at once.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Review a caller's bearer token using the proxy's own credential.
    async fn token_review(&self, token: &str) -> Result<TokenReviewOutcome, ControlPlaneError>;

    /// Ask whether (user, groups) is allowed the action described by `sar`.
    async fn subject_access_review(
        &self,
        user: &str,
        groups: &[String],
        sar: &SarTemplate,
    ) -> Result<bool, ControlPlaneError>;

    /// List the projects visible to the caller's token. The listing must be
    /// authorized as the caller, not as the proxy.
    async fn list_projects(&self, token: &str) -> Result<Vec<Project>, ControlPlaneError>;
}
