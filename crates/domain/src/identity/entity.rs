use std::collections::BTreeSet;

use serde::Deserialize;

/// Result of a control-plane token review.
///
/// Mirrors the authentication/v1 TokenReview status: whether the token is
/// valid, who it belongs to, and the server's error text when it is not.
#[derive(Debug, Clone, Default)]
pub struct TokenReviewOutcome {
    pub authenticated: bool,
    pub username: String,
    pub groups: Vec<String>,
    /// Server-side error text when `authenticated` is false.
    pub error_message: String,
}

impl TokenReviewOutcome {
    pub fn authenticated(username: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            authenticated: true,
            username: username.into(),
            groups,
            error_message: String::new(),
        }
    }

    pub fn rejected(error_message: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            error_message: error_message.into(),
            ..Self::default()
        }
    }
}

/// A tenant boundary in the control plane.
///
/// The UID is a stable opaque identifier; the name is human-chosen and may
/// contain dots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub uuid: String,
}

impl Project {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Project name with dots replaced, safe for use inside index names.
    pub fn index_safe_name(&self) -> String {
        self.name.replace('.', "?")
    }
}

/// SAR template for a backend role: the question asked of the control plane
/// to decide whether a caller is granted the role.
///
/// Deserialized from the `--auth-backend-role name={json}` flag value. A
/// `resource` beginning with `/` is a non-resource URL path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SarTemplate {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub verb: String,

    #[serde(default)]
    pub resource: String,

    #[serde(default, rename = "resourceAPIGroup")]
    pub resource_api_group: String,
}

impl SarTemplate {
    /// Whether this template asks about a URL path rather than a resource.
    pub fn is_non_resource(&self) -> bool {
        self.resource.starts_with('/')
    }
}

/// Everything resolved for one bearer token: the review outcome, the granted
/// backend roles, and the caller's projects in control-plane order.
///
/// Immutable once constructed; the cache hands out shared references.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub review: TokenReviewOutcome,
    pub roles: BTreeSet<String>,
    pub projects: Vec<Project>,
}

/// Identity attached to a request after the authorization handler ran.
///
/// Token-authenticated callers carry username, roles, and projects; callers
/// identified by client certificate carry only the subject.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub username: String,
    pub subject: Option<String>,
    pub projects: Vec<Project>,
    pub roles: Vec<String>,
}
