// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Secrets bundle: the cryptographic material a cluster is built on.
//!
//! A bundle holds the cluster identity, bootstrap tokens and the certificate
//! authorities for etcd, Kubernetes, the aggregation layer and the node OS API.
//! It is generated once per control plane and reused for the lifetime of that
//! control plane. Regenerating it would invalidate every credential issued from it.
//!
//! Certificates and keys are stored as base64-encoded PEM, the layout Talos
//! machine configuration expects.
//!
//! The bundle carries a clock that is not persisted. Whoever loads a bundle
//! resets it to "now" so client certificates are issued with a current validity window.

use crate::errors::BundleError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Datelike, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};

/// Validity of generated certificate authorities.
const CA_VALIDITY_YEARS: i32 = 10;

/// Validity of issued admin client certificates.
const ADMIN_CERT_VALIDITY_YEARS: i32 = 1;

/// Organization the node OS API grants admin access to.
const OS_ADMIN_ROLE: &str = "os:admin";

/// Cluster identity shared by all nodes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSecrets {
    pub id: String,
    pub secret: String,
}

/// Tokens used by nodes to join the cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSecrets {
    /// Kubernetes bootstrap token (`[a-z0-9]{6}.[a-z0-9]{16}`)
    pub bootstrap_token: String,
    /// Key used to encrypt secrets at rest in etcd
    pub secretbox_encryption_secret: String,
}

/// Token machines use to obtain certificates from trustd.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustdInfo {
    pub token: String,
}

/// A base64-encoded PEM certificate and private key.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CertAndKey {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crt: String,
    pub key: String,
}

impl CertAndKey {
    fn from_pem(crt: &str, key: &str) -> Self {
        Self {
            crt: BASE64.encode(crt),
            key: BASE64.encode(key),
        }
    }

    /// The certificate with its private key removed, as handed to workers.
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self {
            crt: self.crt.clone(),
            key: String::new(),
        }
    }

    fn key_pem(&self, what: &'static str) -> Result<String, BundleError> {
        let bytes = BASE64
            .decode(&self.key)
            .map_err(|e| BundleError::KeyGeneration {
                what,
                reason: format!("stored key is not base64: {e}"),
            })?;
        String::from_utf8(bytes).map_err(|e| BundleError::KeyGeneration {
            what,
            reason: format!("stored key is not UTF-8: {e}"),
        })
    }
}

/// Certificate authorities of a cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certs {
    pub etcd: CertAndKey,
    pub k8s: CertAndKey,
    #[serde(rename = "k8saggregator")]
    pub k8s_aggregator: CertAndKey,
    /// Service account signing key (no certificate)
    #[serde(rename = "k8sserviceaccount")]
    pub k8s_service_account: CertAndKey,
    /// Node OS API certificate authority
    pub os: CertAndKey,
}

/// Generated cryptographic material of a cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretsBundle {
    pub cluster: ClusterSecrets,
    pub secrets: BootstrapSecrets,
    pub trustdinfo: TrustdInfo,
    pub certs: Certs,
    #[serde(skip, default = "Utc::now")]
    clock: DateTime<Utc>,
}

impl SecretsBundle {
    /// Generates a new bundle bound to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::KeyGeneration`] if a key pair or certificate
    /// authority cannot be generated.
    pub fn generate(now: DateTime<Utc>) -> Result<Self, BundleError> {
        Ok(Self {
            cluster: ClusterSecrets {
                id: random_secret(),
                secret: random_secret(),
            },
            secrets: BootstrapSecrets {
                bootstrap_token: random_token(),
                secretbox_encryption_secret: random_secret(),
            },
            trustdinfo: TrustdInfo {
                token: random_token(),
            },
            certs: Certs {
                etcd: generate_ca("etcd CA", ca_params("etcd", None, now))?,
                k8s: generate_ca("kubernetes CA", ca_params("kubernetes", None, now))?,
                k8s_aggregator: generate_ca(
                    "aggregator CA",
                    ca_params("front-proxy", None, now),
                )?,
                k8s_service_account: generate_service_account_key()?,
                os: generate_ca("node OS CA", os_ca_params(now))?,
            },
            clock: now,
        })
    }

    /// Serializes the bundle for `status.secretBundle`. The clock is not included.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Serialize`] if YAML serialization fails.
    pub fn to_yaml(&self) -> Result<String, BundleError> {
        serde_yaml::to_string(self).map_err(|source| BundleError::Serialize {
            what: "secrets bundle",
            source,
        })
    }

    /// Parses a persisted bundle. The clock is set to now.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Deserialize`] for malformed input.
    pub fn from_yaml(input: &str) -> Result<Self, BundleError> {
        serde_yaml::from_str(input).map_err(|source| BundleError::Deserialize {
            what: "secrets bundle",
            source,
        })
    }

    /// Time the bundle issues certificates at.
    #[must_use]
    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    pub fn reset_clock(&mut self) {
        self.clock = Utc::now();
    }

    /// Issues an admin client certificate for the node OS API, signed by the OS CA
    /// and valid from the bundle clock.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::KeyGeneration`] if the stored CA key cannot be
    /// loaded or signing fails.
    pub fn issue_admin_certificate(&self) -> Result<CertAndKey, BundleError> {
        const WHAT: &str = "admin client certificate";
        let cert_err = |e: rcgen::Error| BundleError::KeyGeneration {
            what: WHAT,
            reason: e.to_string(),
        };

        let ca_key = KeyPair::from_pem(&self.certs.os.key_pem(WHAT)?).map_err(cert_err)?;
        // Re-signing the CA parameters with the stored key yields an issuer with
        // the same subject and key identifier as the persisted CA certificate.
        let issuer = os_ca_params(self.clock)
            .self_signed(&ca_key)
            .map_err(cert_err)?;

        let admin_key = KeyPair::generate().map_err(cert_err)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(cert_err)?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, OS_ADMIN_ROLE);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        set_validity(&mut params, self.clock, ADMIN_CERT_VALIDITY_YEARS);

        let cert = params
            .signed_by(&admin_key, &issuer, &ca_key)
            .map_err(cert_err)?;
        Ok(CertAndKey::from_pem(&cert.pem(), &admin_key.serialize_pem()))
    }
}

fn ca_params(
    common_name: &str,
    organization: Option<&str>,
    now: DateTime<Utc>,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    if let Some(org) = organization {
        params.distinguished_name.push(DnType::OrganizationName, org);
    }
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, now, CA_VALIDITY_YEARS);
    params
}

/// The OS CA subject is fixed so the issuer can be rebuilt from the stored key
/// when signing client certificates.
fn os_ca_params(now: DateTime<Utc>) -> CertificateParams {
    ca_params("talos", Some("talos"), now)
}

fn generate_ca(what: &'static str, params: CertificateParams) -> Result<CertAndKey, BundleError> {
    let cert_err = |e: rcgen::Error| BundleError::KeyGeneration {
        what,
        reason: e.to_string(),
    };
    let key = KeyPair::generate().map_err(cert_err)?;
    let cert = params.self_signed(&key).map_err(cert_err)?;
    Ok(CertAndKey::from_pem(&cert.pem(), &key.serialize_pem()))
}

fn generate_service_account_key() -> Result<CertAndKey, BundleError> {
    let key = KeyPair::generate().map_err(|e| BundleError::KeyGeneration {
        what: "service account key",
        reason: e.to_string(),
    })?;
    Ok(CertAndKey {
        crt: String::new(),
        key: BASE64.encode(key.serialize_pem()),
    })
}

/// 32 random bytes, base64 encoded.
fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    BASE64.encode(bytes)
}

/// Token of the form `[a-z0-9]{6}.[a-z0-9]{16}`.
fn random_token() -> String {
    let part = |len: usize| -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .map(|b| char::from(b).to_ascii_lowercase())
            .take(len)
            .collect()
    };
    format!("{}.{}", part(6), part(16))
}

/// Valid from the start of the day of `from` for `years` years.
///
/// Days past the 28th are clamped so the end date exists in every month and year.
#[allow(clippy::cast_possible_truncation)]
fn set_validity(params: &mut CertificateParams, from: DateTime<Utc>, years: i32) {
    let month = from.month() as u8;
    let day = from.day().min(28) as u8;
    params.not_before = rcgen::date_time_ymd(from.year(), month, day);
    params.not_after = rcgen::date_time_ymd(from.year() + years, month, day);
}

#[cfg(test)]
#[path = "secrets_tests.rs"]
mod secrets_tests;
