//! Root certificate authority operations
//!
//! This module holds the cryptographic side of the CA control plane: the
//! trust root bundle, the optional local signer, cross-signing for root
//! rotation, join-token generation, and parsing/validation of node
//! certificates. The CA never sees node private keys; nodes generate key
//! pairs locally and submit only CSRs.
//!
//! During a root rotation the signer is the *cross-signed* new root: leaf
//! certificates issued under it carry the cross-signed certificate as an
//! intermediate, so peers that still trust only the old root keep accepting
//! them.

pub mod external;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    PublicKeyData, SignatureAlgorithm,
};
use thiserror::Error;
use x509_parser::oid_registry::asn1_rs::oid;
use x509_parser::prelude::*;

use crate::model::NodeRole;

/// Prefix of every join token; the versioned, human-recognizable part.
pub const JOIN_TOKEN_PREFIX: &str = "SWMTKN-1-";

/// Validity period for generated root CA certificates.
const ROOT_CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for issued node certificates. Not security-critical:
/// root rotation, not expiry, is the rotation mechanism.
pub const NODE_CERT_VALIDITY_DAYS: i64 = 90;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// No local signing material is available.
    #[error("no valid signing material: this root CA can only validate certificates")]
    NoLocalSigner,

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// The certificate does not chain up to this root.
    #[error("certificate verification failed: {0}")]
    VerificationFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse a PEM bundle into the DER bytes of each block.
fn parse_pem_bundle(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM bundle: {}", e)))?;
    Ok(blocks.iter().map(|b| b.contents().to_vec()).collect())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Hex-encode a SHA-256 digest with the algorithm prefix, `sha256:ab12…`.
fn sha256_digest_string(data: &[u8]) -> String {
    use aws_lc_rs::digest::{digest, SHA256};

    let hash = digest(&SHA256, data);
    format!("sha256:{}", hex_encode(hash.as_ref()))
}

/// Digest of a PEM-encoded CA certificate, recorded on the cluster as
/// `ca_cert_hash`.
pub fn ca_cert_hash(ca_cert_pem: &str) -> String {
    sha256_digest_string(ca_cert_pem.trim().as_bytes())
}

/// Generate an opaque random identity (node IDs and similar).
pub fn generate_id() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let mut raw = [0u8; 16];
    aws_lc_rs::rand::fill(&mut raw).expect("random generation failed");
    URL_SAFE_NO_PAD.encode(raw)
}

/// Issuer identity extracted from a certificate: the raw DER subject and
/// subject public key info. This is what node agents report as their
/// certificate issuer and what root rotation converges on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IssuerInfo {
    /// Raw DER-encoded subject name.
    pub subject: Vec<u8>,
    /// Raw DER-encoded SubjectPublicKeyInfo.
    pub public_key: Vec<u8>,
}

/// Extract the issuer identity a leaf signed by this CA certificate would
/// report: the certificate's own subject and public key.
pub fn issuer_info_of_cert(ca_cert_pem: &str) -> Result<IssuerInfo> {
    let der = parse_pem(ca_cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
    Ok(IssuerInfo {
        subject: cert.tbs_certificate.subject.as_raw().to_vec(),
        public_key: cert.tbs_certificate.subject_pki.raw.to_vec(),
    })
}

/// Raw DER issuer name of the leaf (first certificate) in a PEM bundle.
/// Matching it against the signing certificate's subject tells whether a
/// certificate was issued under the currently active signing root.
pub fn certificate_issuer_subject(cert_pem: &str) -> Result<Vec<u8>> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    Ok(cert.tbs_certificate.issuer.as_raw().to_vec())
}

/// Identity fields parsed out of a validated node certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCert {
    /// Node ID (the certificate common name).
    pub node_id: String,
    /// Cluster organization the certificate was issued in.
    pub organization: String,
    /// Role recorded in the certificate's organizational unit.
    pub role: NodeRole,
}

/// Local signing material: a CA (or cross-signed CA) certificate and its
/// private key.
#[derive(Clone)]
pub struct LocalSigner {
    cert_pem: String,
    key_pem: String,
}

impl LocalSigner {
    /// The signing certificate in PEM format.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The signing key in PEM format.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load signing key: {}", e)))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material in debug output
        f.debug_struct("LocalSigner").finish_non_exhaustive()
    }
}

/// The root certificate authority: trust roots, an optional local signer,
/// and any intermediates appended to issued certificates.
#[derive(Clone, Debug)]
pub struct RootCa {
    /// PEM bundle of trusted root certificates.
    certs_pem: String,
    /// PEM intermediates (the cross-signed new root during a rotation).
    intermediates_pem: String,
    signer: Option<LocalSigner>,
    /// Issuer identity of the signing certificate (or the first trust root
    /// when there is no local signer).
    issuer_info: IssuerInfo,
}

impl RootCa {
    /// Build a root CA from existing material.
    ///
    /// `signer` is the certificate/key pair used for local signing; during
    /// a root rotation this is the cross-signed new root, not the served
    /// trust root. `intermediates_pem` is appended to every issued
    /// certificate so presented chains validate under the old root.
    pub fn new(
        certs_pem: &str,
        signer: Option<(&str, &str)>,
        intermediates_pem: &str,
    ) -> Result<Self> {
        if parse_pem_bundle(certs_pem)?.is_empty() {
            return Err(PkiError::ParseError("no CA certificates given".into()));
        }

        let signer = match signer {
            Some((cert_pem, key_pem)) => {
                // Validate eagerly so a bad key surfaces here, not at the
                // first signing attempt.
                KeyPair::from_pem(key_pem)
                    .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
                parse_pem(cert_pem)?;
                Some(LocalSigner {
                    cert_pem: cert_pem.to_string(),
                    key_pem: key_pem.to_string(),
                })
            }
            None => None,
        };

        let issuer_source = signer
            .as_ref()
            .map(|s| s.cert_pem.clone())
            .unwrap_or_else(|| certs_pem.to_string());
        let issuer_info = issuer_info_of_cert(&issuer_source)?;

        Ok(RootCa {
            certs_pem: certs_pem.to_string(),
            intermediates_pem: intermediates_pem.to_string(),
            signer,
            issuer_info,
        })
    }

    /// Generate a fresh self-signed root CA.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity_days(ROOT_CA_VALIDITY_YEARS * 365);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;
        let cert_pem = cert.pem();

        RootCa::new(&cert_pem, Some((&cert_pem, &key_pem)), "")
    }

    /// The trust root bundle in PEM format.
    pub fn certs_pem(&self) -> &str {
        &self.certs_pem
    }

    /// Intermediates appended to issued certificates, if any.
    pub fn intermediates_pem(&self) -> &str {
        &self.intermediates_pem
    }

    /// The local signer, or [`PkiError::NoLocalSigner`] when signing is
    /// external-only.
    pub fn signer(&self) -> Result<&LocalSigner> {
        self.signer.as_ref().ok_or(PkiError::NoLocalSigner)
    }

    /// Whether local signing material is present.
    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    /// Issuer identity that leaves signed by this CA will present.
    pub fn issuer_info(&self) -> &IssuerInfo {
        &self.issuer_info
    }

    /// Sign a node CSR, overriding its subject with the node identity:
    /// CN = node ID, OU = role, O = cluster organization.
    ///
    /// Returns the issued leaf followed by any intermediates.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        node_id: &str,
        role: NodeRole,
        organization: &str,
    ) -> Result<String> {
        let signer = self.signer()?;

        let mut csr_params = parse_csr(csr_pem)?;
        apply_node_template(&mut csr_params.params, node_id, role, organization);

        let ca_key = signer.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&signer.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(append_intermediates(signed.pem(), &self.intermediates_pem))
    }

    /// Append this root's intermediate bundle to an externally issued
    /// leaf, so the chain it presents validates like a locally signed one.
    pub fn append_intermediates(&self, leaf_pem: String) -> String {
        append_intermediates(leaf_pem, &self.intermediates_pem)
    }

    /// Cross-sign another CA certificate with this root, preserving its
    /// subject and public key. The result lets peers trusting only this
    /// root validate chains issued under the other CA.
    pub fn cross_sign_ca_certificate(&self, ca_cert_pem: &str) -> Result<String> {
        let signer = self.signer()?;

        let der = parse_pem(ca_cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        let algorithm =
            detect_algorithm(&cert.tbs_certificate.subject_pki.algorithm).ok_or_else(|| {
                PkiError::ParseError("unsupported public key algorithm in CA cert".into())
            })?;
        let public_key = SpkiPublicKey {
            spki_der: cert.tbs_certificate.subject_pki.raw.to_vec(),
            algorithm,
        };

        let mut params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to read CA cert params: {}", e)))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let ca_key = signer.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&signer.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cross_signed = params.signed_by(&public_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to cross-sign: {}", e))
        })?;

        Ok(cross_signed.pem())
    }

    /// Generate a join token bound to this root: the token embeds a digest
    /// component of the trust bundle plus a fresh random secret, so tokens
    /// minted under one root do not carry over to another. Components are
    /// hex so the token stays typable and splits unambiguously.
    pub fn generate_join_token(&self) -> String {
        use aws_lc_rs::digest::{digest, SHA256};

        let hash = digest(&SHA256, self.certs_pem.trim().as_bytes());

        let mut secret = [0u8; 16];
        aws_lc_rs::rand::fill(&mut secret).expect("random generation failed");

        format!(
            "{}{}-{}",
            JOIN_TOKEN_PREFIX,
            hex_encode(&hash.as_ref()[..16]),
            hex_encode(&secret),
        )
    }

    /// Validate that a certificate was issued by this root (or by one of
    /// its intermediates, e.g. the cross-signed predecessor during a
    /// rotation) and parse the node identity out of it.
    pub fn parse_validate(&self, cert_pem: &str) -> Result<ParsedCert> {
        let leaf_der = parse_pem(cert_pem)?;
        let (_, leaf) = X509Certificate::from_der(&leaf_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let mut issuer_ders = parse_pem_bundle(&self.certs_pem)?;
        if !self.intermediates_pem.is_empty() {
            issuer_ders.extend(parse_pem_bundle(&self.intermediates_pem)?);
        }

        let mut verified = false;
        for issuer_der in &issuer_ders {
            let Ok((_, issuer)) = X509Certificate::from_der(issuer_der) else {
                continue;
            };
            if issuer.subject().as_raw() != leaf.issuer().as_raw() {
                continue;
            }
            if leaf.verify_signature(Some(issuer.public_key())).is_ok() {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(PkiError::VerificationFailed(
                "certificate was not signed by this root CA".into(),
            ));
        }

        let subject = leaf.subject();
        let node_id = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organization = subject
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or("")
            .to_string();
        let role = subject
            .iter_organizational_unit()
            .next()
            .and_then(|ou| ou.as_str().ok())
            .and_then(NodeRole::from_organizational_unit)
            .ok_or_else(|| {
                PkiError::VerificationFailed("certificate carries no node role".into())
            })?;

        Ok(ParsedCert {
            node_id,
            organization,
            role,
        })
    }
}

/// Decode a PEM CSR, failing with [`PkiError::InvalidCsr`] on garbage.
pub fn parse_csr(csr_pem: &str) -> Result<CertificateSigningRequestParams> {
    CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(e.to_string()))
}

/// Generate a key pair and CSR for a node. The private key never leaves
/// the caller.
pub fn generate_csr() -> Result<(String, String)> {
    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e)))?;
    let key_pem = key_pair.serialize_pem();

    // Subject fields are overridden by the CA at signing time, so the CSR
    // carries none.
    let params = CertificateParams::default();
    let csr = params.serialize_request(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
    })?;
    let csr_pem = csr.pem().map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
    })?;

    Ok((csr_pem, key_pem))
}

/// Override certificate parameters with the node identity template. The
/// CA controls subject, usage and validity; only the public key comes from
/// the CSR.
fn apply_node_template(
    params: &mut CertificateParams,
    node_id: &str,
    role: NodeRole,
    organization: &str,
) {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(node_id.to_string()));
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(role.organizational_unit().to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let (not_before, not_after) = compute_validity_days(NODE_CERT_VALIDITY_DAYS);
    params.not_before = not_before;
    params.not_after = not_after;
}

/// Append the intermediate bundle to an issued leaf certificate.
fn append_intermediates(leaf_pem: String, intermediates_pem: &str) -> String {
    if intermediates_pem.is_empty() {
        return leaf_pem;
    }
    let mut bundle = leaf_pem;
    if !bundle.ends_with('\n') {
        bundle.push('\n');
    }
    bundle.push_str(intermediates_pem);
    bundle
}

fn compute_validity_days(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

/// Public key lifted out of a parsed certificate, for cross-signing
/// without access to the subject's private key.
struct SpkiPublicKey {
    spki_der: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
}

impl PublicKeyData for SpkiPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.spki_der
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

/// Map an x509 public key algorithm identifier to the rcgen signature
/// algorithm used when re-signing that key.
fn detect_algorithm(alg: &AlgorithmIdentifier<'_>) -> Option<&'static SignatureAlgorithm> {
    let ec_oid = oid!(1.2.840 .10045 .2 .1);
    let ed25519_oid = oid!(1.3.101 .112);
    let secp256r1_oid = oid!(1.2.840 .10045 .3 .1 .7);
    let secp384r1_oid = oid!(1.3.132 .0 .34);

    if alg.algorithm == ed25519_oid {
        return Some(&rcgen::PKCS_ED25519);
    }
    if alg.algorithm == ec_oid {
        if let Some(params) = &alg.parameters {
            if let Ok(curve_oid) = params.as_oid() {
                if curve_oid == secp256r1_oid {
                    return Some(&rcgen::PKCS_ECDSA_P256_SHA256);
                }
                if curve_oid == secp384r1_oid {
                    return Some(&rcgen::PKCS_ECDSA_P384_SHA384);
                }
            }
        }
    }
    None
}
