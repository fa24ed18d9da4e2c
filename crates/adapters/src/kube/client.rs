use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, PostParams};
use kube::config::{AuthInfo, KubeConfigOptions};
use kube::{Client, Config, ResourceExt};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tracing::{debug, trace};

use domain::error::ControlPlaneError;
use domain::identity::entity::{Project, SarTemplate, TokenReviewOutcome};
use ports::secondary::control_plane::ControlPlane;
use ports::secondary::metrics_port::ControlPlaneMetrics;

/// Control-plane client backed by the Kubernetes API server.
///
/// Token and subject-access reviews run with the proxy's own service
/// account. Project listings run with a caller-scoped client: the proxy's
/// config is stripped of every credential and the caller's token becomes
/// the only one, so the server authorizes the listing as the caller.
pub struct KubeControlPlane {
    client: Client,
    config: Config,
    metrics: Arc<dyn ControlPlaneMetrics>,
}

impl KubeControlPlane {
    /// Connect using the in-cluster service account, falling back to the
    /// local kubeconfig. Extra CA roots from `--openshift-ca` are appended
    /// to the trust store.
    pub async fn new(
        openshift_cas: &[PathBuf],
        metrics: Arc<dyn ControlPlaneMetrics>,
    ) -> anyhow::Result<Self> {
        let mut config = infer_config().await?;

        for path in openshift_cas {
            let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
                .map_err(|e| {
                    anyhow::anyhow!("failed to read control-plane CA '{}': {e}", path.display())
                })?
                .collect::<Result<_, _>>()
                .map_err(|e| {
                    anyhow::anyhow!("failed to parse control-plane CA '{}': {e}", path.display())
                })?;
            config
                .root_cert
                .get_or_insert_with(Vec::new)
                .extend(certs.into_iter().map(|cert| cert.as_ref().to_vec()));
        }

        trace!(cluster_url = %config.cluster_url, "creating control-plane client");
        let client = Client::try_from(config.clone())
            .map_err(|e| anyhow::anyhow!("failed to create control-plane client: {e}"))?;

        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    /// A client whose only credential is the caller's bearer token.
    fn caller_client(&self, token: &str) -> Result<Client, ControlPlaneError> {
        let mut config = self.config.clone();
        config.auth_info = AuthInfo::default();
        config.auth_info.token = Some(token.to_string().into());
        Client::try_from(config).map_err(|e| ControlPlaneError(e.to_string()))
    }

    fn record(&self, call: &str, outcome: &str) {
        self.metrics.record_control_plane_call(call, outcome);
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn token_review(&self, token: &str) -> Result<TokenReviewOutcome, ControlPlaneError> {
        debug!("performing token review");
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..TokenReviewSpec::default()
            },
            ..TokenReview::default()
        };
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| {
                self.record("token_review", "error");
                ControlPlaneError(e.to_string())
            })?;
        self.record("token_review", "ok");
        Ok(review_outcome(created))
    }

    async fn subject_access_review(
        &self,
        user: &str,
        groups: &[String],
        sar: &SarTemplate,
    ) -> Result<bool, ControlPlaneError> {
        debug!(user, "performing subject access review");
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &sar_body(user, groups, sar))
            .await
            .map_err(|e| {
                self.record("subject_access_review", "error");
                ControlPlaneError(e.to_string())
            })?;
        self.record("subject_access_review", "ok");
        Ok(created.status.map(|status| status.allowed).unwrap_or(false))
    }

    async fn list_projects(&self, token: &str) -> Result<Vec<Project>, ControlPlaneError> {
        if token.is_empty() {
            return Err(ControlPlaneError(
                "attempted to list projects with an empty token".to_string(),
            ));
        }
        let client = self.caller_client(token)?;

        let api: Api<DynamicObject> = Api::all_with(client.clone(), &projects_resource());
        match api.list(&ListParams::default()).await {
            Ok(list) => {
                self.record("list_projects", "ok");
                Ok(list.items.iter().map(project_from_dynamic).collect())
            }
            // Clusters without the projects API serve plain namespaces.
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("projects API unavailable, listing namespaces");
                let api: Api<Namespace> = Api::all(client);
                match api.list(&ListParams::default()).await {
                    Ok(list) => {
                        self.record("list_projects", "ok");
                        Ok(list
                            .items
                            .iter()
                            .map(|ns| {
                                Project::new(
                                    ns.name_any(),
                                    ns.metadata.uid.clone().unwrap_or_default(),
                                )
                            })
                            .collect())
                    }
                    Err(e) => {
                        self.record("list_projects", "error");
                        Err(ControlPlaneError(e.to_string()))
                    }
                }
            }
            Err(e) => {
                self.record("list_projects", "error");
                Err(ControlPlaneError(e.to_string()))
            }
        }
    }
}

async fn infer_config() -> anyhow::Result<Config> {
    match Config::incluster() {
        Ok(config) => {
            trace!("created in-cluster control-plane config");
            Ok(config)
        }
        Err(in_cluster_err) => {
            match Config::from_kubeconfig(&KubeConfigOptions::default()).await {
                Ok(config) => {
                    trace!("created kubeconfig-based control-plane config");
                    Ok(config)
                }
                Err(kubeconfig_err) => Err(anyhow::anyhow!(
                    "could not create control-plane config for both in-cluster \
                     [{in_cluster_err}] and kubeconfig [{kubeconfig_err}]"
                )),
            }
        }
    }
}

fn projects_resource() -> ApiResource {
    ApiResource {
        group: "project.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "project.openshift.io/v1".to_string(),
        kind: "Project".to_string(),
        plural: "projects".to_string(),
    }
}

fn review_outcome(review: TokenReview) -> TokenReviewOutcome {
    let status = review.status.unwrap_or_default();
    let user = status.user.unwrap_or_default();
    TokenReviewOutcome {
        authenticated: status.authenticated.unwrap_or(false),
        username: user.username.unwrap_or_default(),
        groups: user.groups.unwrap_or_default(),
        error_message: status.error.unwrap_or_default(),
    }
}

/// A `resource` beginning with `/` is a URL-path question; everything else
/// asks about a namespaced resource.
fn sar_body(user: &str, groups: &[String], sar: &SarTemplate) -> SubjectAccessReview {
    let mut spec = SubjectAccessReviewSpec {
        user: Some(user.to_string()),
        groups: Some(groups.to_vec()),
        ..SubjectAccessReviewSpec::default()
    };
    if sar.is_non_resource() {
        spec.non_resource_attributes = Some(NonResourceAttributes {
            path: Some(sar.resource.clone()),
            verb: Some(sar.verb.clone()),
        });
    } else {
        spec.resource_attributes = Some(ResourceAttributes {
            namespace: Some(sar.namespace.clone()),
            verb: Some(sar.verb.clone()),
            resource: Some(sar.resource.clone()),
            group: Some(sar.resource_api_group.clone()),
            ..ResourceAttributes::default()
        });
    }
    SubjectAccessReview {
        spec,
        ..SubjectAccessReview::default()
    }
}

fn project_from_dynamic(obj: &DynamicObject) -> Project {
    Project::new(obj.name_any(), obj.metadata.uid.clone().unwrap_or_default())
}
