//! Certificate actor: makes sure the CA, node and client secrets exist
//! before any node of a secure cluster starts.

use async_trait::async_trait;
use crdb_api::{ClusterKey, ConditionType};
use tracing::{info, warn};

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::ReconcileError;
use crate::pki::{self, CertificateAuthority, PkiError};
use crate::platform::Secret;
use crate::workload;

pub struct CertificateActor;

#[async_trait]
impl Actor for CertificateActor {
    fn name(&self) -> &'static str {
        "certificate"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::CertificatesReady
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        input.target.tls && !input.snapshot.certificates.all_valid()
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;

        // Re-read so that a retry after a partial write only fills the gaps.
        let ca = effects.get_secret(key, &workload::ca_secret_name(key)).await?;
        let node = effects.get_secret(key, &workload::node_secret_name(key)).await?;
        let client = effects
            .get_secret(key, &workload::client_secret_name(key))
            .await?;

        // An existing CA is never replaced, even when it is unusable.
        if let Some(secret) = ca.as_ref().filter(|s| !pki::ca_state(Some(*s)).is_valid()) {
            warn!(cluster = %key, secret = %secret.name, "CA secret is not usable");
            return Ok(Outcome::failed(
                "CertificateInvalid",
                format!(
                    "secret {} does not hold a valid CA certificate and key",
                    secret.name
                ),
            ));
        }

        let writes = secrets_to_write(key, ca, node.as_ref(), client.as_ref()).map_err(|e| {
            ReconcileError::Action {
                operation: "issue_certificates",
                message: e.to_string(),
            }
        })?;

        for secret in &writes {
            info!(cluster = %key, secret = %secret.name, "writing certificate secret");
            effects.apply_secret(key, secret).await?;
        }

        Ok(Outcome::completed(format!(
            "wrote {} certificate secret(s)",
            writes.len()
        )))
    }
}

/// Secrets that must be (re)written, CA first.
///
/// An existing CA is reused and only the leaves that do not chain to it are
/// reissued. A CA is only generated when none exists.
fn secrets_to_write(
    key: &ClusterKey,
    ca: Option<Secret>,
    node: Option<&Secret>,
    client: Option<&Secret>,
) -> Result<Vec<Secret>, PkiError> {
    let mut writes = Vec::new();

    let (authority, ca_secret) = match ca {
        Some(secret) => (CertificateAuthority::from_secret(&secret)?, secret),
        None => {
            let authority = CertificateAuthority::generate()?;
            let secret = authority.to_secret(workload::ca_secret_name(key));
            writes.push(secret.clone());
            (authority, secret)
        }
    };

    if !pki::leaf_state(node, Some(&ca_secret)).is_valid() {
        writes.push(authority.issue_node(key)?);
    }
    if !pki::leaf_state(client, Some(&ca_secret)).is_valid() {
        writes.push(authority.issue_client(key, pki::CLIENT_USER)?);
    }

    Ok(writes)
}
