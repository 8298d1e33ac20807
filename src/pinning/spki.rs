//! SubjectPublicKeyInfo reconstruction and public-key pin computation.
//!
//! A pin is the base64 SHA-256 of a certificate's SubjectPublicKeyInfo. The
//! SPKI is rebuilt from the raw public key and a fixed ASN.1 prefix chosen by
//! key algorithm and size, so only the four combinations below are supported.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

const RSA_2048_SPKI_HEADER: [u8; 24] = [
    0x30, 0x82, 0x01, 0x22, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01,
    0x01, 0x05, 0x00, 0x03, 0x82, 0x01, 0x0f, 0x00,
];

const RSA_4096_SPKI_HEADER: [u8; 24] = [
    0x30, 0x82, 0x02, 0x22, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01,
    0x01, 0x05, 0x00, 0x03, 0x82, 0x02, 0x0f, 0x00,
];

const ECDSA_P256_SPKI_HEADER: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

const ECDSA_P384_SPKI_HEADER: [u8; 23] = [
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
    0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpkiError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("unsupported public key: {algorithm} ({bits} bits), SPKI header cannot be created")]
    UnsupportedKey { algorithm: String, bits: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

/// The supported (algorithm, size) combinations, each with its fixed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpkiHeader {
    Rsa2048,
    Rsa4096,
    EcdsaP256,
    EcdsaP384,
}

impl SpkiHeader {
    pub const ALL: [SpkiHeader; 4] = [
        SpkiHeader::Rsa2048,
        SpkiHeader::Rsa4096,
        SpkiHeader::EcdsaP256,
        SpkiHeader::EcdsaP384,
    ];

    pub fn lookup(algorithm: KeyAlgorithm, bits: usize) -> Option<Self> {
        match (algorithm, bits) {
            (KeyAlgorithm::Rsa, 2048) => Some(Self::Rsa2048),
            (KeyAlgorithm::Rsa, 4096) => Some(Self::Rsa4096),
            (KeyAlgorithm::Ec, 256) => Some(Self::EcdsaP256),
            (KeyAlgorithm::Ec, 384) => Some(Self::EcdsaP384),
            _ => None,
        }
    }

    pub fn algorithm(self) -> KeyAlgorithm {
        match self {
            Self::Rsa2048 | Self::Rsa4096 => KeyAlgorithm::Rsa,
            Self::EcdsaP256 | Self::EcdsaP384 => KeyAlgorithm::Ec,
        }
    }

    pub fn bits(self) -> usize {
        match self {
            Self::Rsa2048 => 2048,
            Self::Rsa4096 => 4096,
            Self::EcdsaP256 => 256,
            Self::EcdsaP384 => 384,
        }
    }

    pub fn prefix(self) -> &'static [u8] {
        match self {
            Self::Rsa2048 => &RSA_2048_SPKI_HEADER,
            Self::Rsa4096 => &RSA_4096_SPKI_HEADER,
            Self::EcdsaP256 => &ECDSA_P256_SPKI_HEADER,
            Self::EcdsaP384 => &ECDSA_P384_SPKI_HEADER,
        }
    }
}

/// A certificate's public key as the platform exposes it: family, size and
/// the external representation (PKCS#1 `RSAPublicKey` or an uncompressed EC
/// point).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPublicKey {
    pub algorithm: Option<KeyAlgorithm>,
    pub bits: usize,
    pub data: Vec<u8>,
    /// Dotted algorithm OID, kept for error reporting.
    pub algorithm_oid: String,
}

impl RawPublicKey {
    /// Extract the public key from a DER encoded X.509 certificate.
    pub fn from_certificate(cert_der: &[u8]) -> Result<Self, SpkiError> {
        let (_, cert) =
            X509Certificate::from_der(cert_der).map_err(|e| SpkiError::Parse(e.to_string()))?;
        let spki = cert.public_key();
        let data: &[u8] = spki.subject_public_key.data.as_ref();
        let oid = &spki.algorithm.algorithm;

        let (algorithm, bits) = if *oid == OID_PKCS1_RSAENCRYPTION {
            let bits = match spki.parsed() {
                Ok(PublicKey::RSA(rsa)) => modulus_bits(rsa.modulus),
                Ok(_) => 0,
                Err(e) => return Err(SpkiError::Parse(e.to_string())),
            };
            (Some(KeyAlgorithm::Rsa), bits)
        } else if *oid == OID_KEY_TYPE_EC_PUBLIC_KEY {
            // Uncompressed point: 0x04 || X || Y
            (Some(KeyAlgorithm::Ec), data.len().saturating_sub(1) * 4)
        } else {
            (None, data.len() * 8)
        };

        Ok(Self {
            algorithm,
            bits,
            data: data.to_vec(),
            algorithm_oid: oid.to_id_string(),
        })
    }

    pub fn spki_header(&self) -> Result<SpkiHeader, SpkiError> {
        self.algorithm
            .and_then(|algorithm| SpkiHeader::lookup(algorithm, self.bits))
            .ok_or_else(|| SpkiError::UnsupportedKey {
                algorithm: self.algorithm_oid.clone(),
                bits: self.bits,
            })
    }

    /// Prefix + raw key bytes.
    pub fn subject_public_key_info(&self) -> Result<Vec<u8>, SpkiError> {
        let header = self.spki_header()?;
        let mut spki = Vec::with_capacity(header.prefix().len() + self.data.len());
        spki.extend_from_slice(header.prefix());
        spki.extend_from_slice(&self.data);
        Ok(spki)
    }
}

/// Bit length of a big-endian unsigned modulus.
fn modulus_bits(modulus: &[u8]) -> usize {
    let significant = match modulus.iter().position(|b| *b != 0) {
        Some(start) => &modulus[start..],
        None => return 0,
    };
    (significant.len() - 1) * 8 + (8 - significant[0].leading_zeros() as usize)
}

/// Base64 SHA-256 of an SPKI blob.
pub fn spki_pin(spki: &[u8]) -> String {
    BASE64.encode(Sha256::digest(spki))
}

/// Pin of a DER encoded certificate.
pub fn certificate_pin(cert_der: &[u8]) -> Result<String, SpkiError> {
    let key = RawPublicKey::from_certificate(cert_der)?;
    Ok(spki_pin(&key.subject_public_key_info()?))
}
