//! Certificate material for secure clusters.
//!
//! A cluster with TLS enabled needs three secrets before any node starts:
//!
//! - `<cluster>-ca`: the cluster CA (`ca.crt`, `ca.key`)
//! - `<cluster>-node`: the node certificate shared by every pod
//! - `<cluster>-root`: a client certificate for the `root` SQL user
//!
//! Leaf secrets carry a copy of `ca.crt` so they can be mounted on their own.
//! A leaf whose `ca.crt` does not match the CA secret is treated as invalid,
//! which is how a replaced CA propagates to the leaves.

use chrono::{Datelike, Utc};
use crdb_api::ClusterKey;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::platform::Secret;
use crate::snapshot::SecretState;
use crate::workload;

pub const CA_CERT: &str = "ca.crt";
pub const CA_KEY: &str = "ca.key";
pub const TLS_CERT: &str = "tls.crt";
pub const TLS_KEY: &str = "tls.key";

/// SQL user the client certificate is issued to.
pub const CLIENT_USER: &str = "root";

const CA_COMMON_NAME: &str = "Cockroach CA";
const ORGANIZATION: &str = "Cockroach";
const CA_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 5;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("CA secret unusable: {0}")]
    InvalidCa(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// The cluster certificate authority.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
    /// Signing handle rebuilt from the stored key. Only its subject and
    /// key are used when issuing, so it need not be byte-identical to
    /// `cert_pem`.
    issuer: Certificate,
    key_pair: KeyPair,
}

impl CertificateAuthority {
    /// Create a fresh self-signed CA.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let issuer = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        Ok(Self {
            cert_pem: issuer.pem(),
            key_pem: key_pair.serialize_pem(),
            issuer,
            key_pair,
        })
    }

    /// Load the CA from its secret.
    ///
    /// The certificate must be a current self-signed certificate for the
    /// stored key.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let cert_pem = secret
            .data
            .get(CA_CERT)
            .ok_or_else(|| PkiError::InvalidCa(format!("{} has no {CA_CERT}", secret.name)))?;
        let key_pem = secret
            .data
            .get(CA_KEY)
            .ok_or_else(|| PkiError::InvalidCa(format!("{} has no {CA_KEY}", secret.name)))?;
        verify_certificate(cert_pem, key_pem, cert_pem)
            .map_err(|e| PkiError::InvalidCa(format!("{}: {e}", secret.name)))?;

        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| PkiError::InvalidCa(e.to_string()))?;
        let issuer = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.clone(),
            key_pem: key_pem.clone(),
            issuer,
            key_pair,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn to_secret(&self, name: impl Into<String>) -> Secret {
        let mut secret = Secret {
            name: name.into(),
            ..Default::default()
        };
        secret.data.insert(CA_CERT.to_string(), self.cert_pem.clone());
        secret.data.insert(CA_KEY.to_string(), self.key_pem.clone());
        secret
    }

    /// Issue the node certificate for every pod of `key`.
    pub fn issue_node(&self, key: &ClusterKey) -> Result<Secret> {
        let mut params = CertificateParams::new(node_sans(key))
            .map_err(|e| PkiError::Signing(e.to_string()))?;
        params.distinguished_name = distinguished_name("node");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        self.issue(params, workload::node_secret_name(key))
    }

    /// Issue a client certificate for `user`.
    pub fn issue_client(&self, key: &ClusterKey, user: &str) -> Result<Secret> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(user);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params, workload::client_secret_name(key))
    }

    fn issue(&self, mut params: CertificateParams, secret_name: String) -> Result<Secret> {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        set_validity(&mut params, LEAF_VALIDITY_YEARS);

        let leaf_key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        let mut secret = Secret {
            name: secret_name,
            ..Default::default()
        };
        secret.data.insert(CA_CERT.to_string(), self.cert_pem.clone());
        secret.data.insert(TLS_CERT.to_string(), cert.pem());
        secret.data.insert(TLS_KEY.to_string(), leaf_key.serialize_pem());
        Ok(secret)
    }
}

/// Names the node certificate must be valid for.
pub fn node_sans(key: &ClusterKey) -> Vec<String> {
    let service = &key.name;
    let ns = &key.namespace;
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        workload::public_service_name(key),
        format!("{}.{ns}", workload::public_service_name(key)),
        format!("{}.{ns}.svc.cluster.local", workload::public_service_name(key)),
        format!("*.{service}"),
        format!("*.{service}.{ns}"),
        format!("*.{service}.{ns}.svc.cluster.local"),
    ]
}

/// Classify the CA secret.
pub fn ca_state(secret: Option<&Secret>) -> SecretState {
    let Some(secret) = secret else {
        return SecretState::Absent;
    };
    let verified = match (secret.data.get(CA_CERT), secret.data.get(CA_KEY)) {
        (Some(cert), Some(key)) => verify_certificate(cert, key, cert).is_ok(),
        _ => false,
    };

    if verified {
        SecretState::Valid
    } else {
        SecretState::Invalid
    }
}

/// Classify a leaf secret against the CA it should chain to.
pub fn leaf_state(secret: Option<&Secret>, ca: Option<&Secret>) -> SecretState {
    let Some(secret) = secret else {
        return SecretState::Absent;
    };
    let Some(ca_cert) = ca.and_then(|ca| ca.data.get(CA_CERT)) else {
        return SecretState::Invalid;
    };
    let chains = secret.data.get(CA_CERT) == Some(ca_cert);
    let verified = match (secret.data.get(TLS_CERT), secret.data.get(TLS_KEY)) {
        (Some(cert), Some(key)) => verify_certificate(cert, key, ca_cert).is_ok(),
        _ => false,
    };

    if chains && verified {
        SecretState::Valid
    } else {
        SecretState::Invalid
    }
}

/// Check that `cert_pem` parses, is inside its validity window, belongs to
/// `key_pem` and carries a signature made by the key of `signer_pem`.
///
/// A self-signed certificate is its own signer.
pub fn verify_certificate(cert_pem: &str, key_pem: &str, signer_pem: &str) -> Result<()> {
    let cert_der = certificate_der(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| invalid(format!("failed to parse certificate: {e}")))?;
    let signer_der = certificate_der(signer_pem)?;
    let (_, signer) = X509Certificate::from_der(&signer_der)
        .map_err(|e| invalid(format!("failed to parse issuer certificate: {e}")))?;

    let now = Utc::now().timestamp();
    if now < cert.validity().not_before.timestamp() {
        return Err(invalid("certificate not yet valid"));
    }
    if now >= cert.validity().not_after.timestamp() {
        return Err(invalid("certificate expired"));
    }

    let key_pair = KeyPair::from_pem(key_pem).map_err(|e| invalid(format!("bad key: {e}")))?;
    if cert.public_key().subject_public_key.data[..] != key_pair.public_key_raw()[..] {
        return Err(invalid("certificate does not match its key"));
    }

    cert.verify_signature(Some(signer.public_key()))
        .map_err(|_| invalid("signature verification failed"))
}

fn certificate_der(pem: &str) -> Result<Vec<u8>> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| invalid(format!("failed to parse PEM: {e}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(invalid(format!("unexpected PEM block {}", pem.label)));
    }
    Ok(pem.contents)
}

fn invalid(message: impl Into<String>) -> PkiError {
    PkiError::InvalidCertificate(message.into())
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(CA_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, CA_VALIDITY_YEARS);
    params
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Validity window starting today, `years` long.
fn set_validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    // date_time_ymd takes a u8 day; clamping keeps Feb 29 from overflowing
    // in the end year.
    let month = today.month() as u8;
    let day = today.day().min(28) as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}
