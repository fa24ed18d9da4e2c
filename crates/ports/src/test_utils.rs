use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use domain::error::ControlPlaneError;
use domain::identity::entity::{Project, SarTemplate, TokenReviewOutcome};

use crate::secondary::control_plane::ControlPlane;
use crate::secondary::metrics_port::{ControlPlaneMetrics, IdentityCacheMetrics, RequestMetrics};

/// No-op implementation of all metrics sub-traits for use in tests.
///
/// All methods inherit the default no-op implementations from the sub-traits.
pub struct NoopMetrics;

impl RequestMetrics for NoopMetrics {}
impl IdentityCacheMetrics for NoopMetrics {}
impl ControlPlaneMetrics for NoopMetrics {}

/// Scriptable in-memory control plane with call counters.
///
/// Defaults to an authenticated `test-user` with no roles and no projects;
/// builder methods override individual answers. Counters let tests assert
/// how often the control plane was actually consulted (cache hit ratio,
/// single-flight).
pub struct StubControlPlane {
    review: Result<TokenReviewOutcome, ControlPlaneError>,
    allowed_roles: BTreeSet<String>,
    sar_failures: BTreeSet<String>,
    projects: Result<Vec<Project>, ControlPlaneError>,

    pub token_reviews: AtomicUsize,
    pub sar_calls: AtomicUsize,
    pub project_lists: AtomicUsize,
}

impl Default for StubControlPlane {
    fn default() -> Self {
        Self {
            review: Ok(TokenReviewOutcome::authenticated("test-user", vec![])),
            allowed_roles: BTreeSet::new(),
            sar_failures: BTreeSet::new(),
            projects: Ok(vec![]),
            token_reviews: AtomicUsize::new(0),
            sar_calls: AtomicUsize::new(0),
            project_lists: AtomicUsize::new(0),
        }
    }
}

impl StubControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_review(mut self, review: TokenReviewOutcome) -> Self {
        self.review = Ok(review);
        self
    }

    pub fn with_review_error(mut self, message: &str) -> Self {
        self.review = Err(ControlPlaneError(message.to_string()));
        self
    }

    /// Roles whose SAR answers "allowed". The template's `resource` field is
    /// used as the role discriminator, matching how resolver tests configure
    /// one distinct template per role.
    pub fn allowing_resources(mut self, resources: &[&str]) -> Self {
        self.allowed_roles = resources.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Resources whose SAR fails with a transport error instead of answering.
    pub fn failing_resources(mut self, resources: &[&str]) -> Self {
        self.sar_failures = resources.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_projects(mut self, projects: Vec<Project>) -> Self {
        self.projects = Ok(projects);
        self
    }

    pub fn with_project_error(mut self, message: &str) -> Self {
        self.projects = Err(ControlPlaneError(message.to_string()));
        self
    }
}

#[async_trait]
impl ControlPlane for StubControlPlane {
    async fn token_review(&self, _token: &str) -> Result<TokenReviewOutcome, ControlPlaneError> {
        self.token_reviews.fetch_add(1, Ordering::SeqCst);
        self.review.clone()
    }

    async fn subject_access_review(
        &self,
        _user: &str,
        _groups: &[String],
        sar: &SarTemplate,
    ) -> Result<bool, ControlPlaneError> {
        self.sar_calls.fetch_add(1, Ordering::SeqCst);
        if self.sar_failures.contains(&sar.resource) {
            return Err(ControlPlaneError(format!(
                "sar transport failure for {}",
                sar.resource
            )));
        }
        Ok(self.allowed_roles.contains(&sar.resource))
    }

    async fn list_projects(&self, _token: &str) -> Result<Vec<Project>, ControlPlaneError> {
        self.project_lists.fetch_add(1, Ordering::SeqCst);
        self.projects.clone()
    }
}
