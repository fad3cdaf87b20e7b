// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use num_bigint_dig::BigUint;
use pkcs8::DecodePublicKey;
use prost::Message;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use sha2::Sha256;
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{DecodePem, referenced::OwnedToRef},
};

use crate::protobuf::chromeos_update_engine::Signatures;

/// Size of a SHA-256 digest, the only hash algorithm used for payload
/// metadata signatures.
pub const SHA256_DIGEST_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for SHA-256")]
    InvalidDigestLength(usize),
    #[error("No public keys available for verification")]
    NoPublicKeys,
    #[error("Signature container contains no signatures")]
    NoSignatures,
    #[error("Signature does not match any trusted public key")]
    SignatureMismatch { decrypted: Vec<u8> },
    #[error("Failed to decode signature container")]
    SignaturesDecode(#[source] prost::DecodeError),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

/// Copied from rsa-0.9.6 since the function is not exported.
fn pkcs1v15_sign_pad(prefix: &[u8], hashed: &[u8], k: usize) -> rsa::Result<Vec<u8>> {
    let hash_len = hashed.len();
    let t_len = prefix.len() + hashed.len();
    if k < t_len + 11 {
        return Err(rsa::Error::MessageTooLong);
    }

    // EM = 0x00 || 0x01 || PS || 0x00 || T
    let mut em = vec![0xff; k];
    em[0] = 0;
    em[1] = 1;
    em[k - t_len - 1] = 0;
    em[k - t_len..k - hash_len].copy_from_slice(prefix);
    em[k - hash_len..k].copy_from_slice(hashed);

    Ok(em)
}

/// Apply the public key operation to a raw signature without removing any
/// padding. Returns [`None`] if the signature is not a valid input for the
/// key. The result is left-padded with zeros to the key size.
fn rsa_public_decrypt(key: &RsaPublicKey, signature: &[u8]) -> Option<Vec<u8>> {
    let k = key.size();
    if signature.len() != k {
        return None;
    }

    let s = BigUint::from_bytes_be(signature);
    if &s >= key.n() {
        return None;
    }

    let m = s.modpow(key.e(), key.n()).to_bytes_be();
    if m.len() > k {
        return None;
    }

    let mut result = vec![0u8; k - m.len()];
    result.extend_from_slice(&m);

    Some(result)
}

/// Sign a SHA-256 digest with PKCS#1 v1.5 padding. The output is the raw
/// signature, exactly the size of the key.
pub fn sign_raw(key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
    if digest.len() != SHA256_DIGEST_SIZE {
        return Err(Error::InvalidDigestLength(digest.len()));
    }

    let scheme = Pkcs1v15Sign::new::<Sha256>();

    key.sign(scheme, digest).map_err(|e| Error::RsaSign(Box::new(e)))
}

/// Verifier for payload metadata signatures. Multiple keys may be trusted at
/// the same time to support key rotation.
#[derive(Clone, Debug)]
pub struct PayloadVerifier {
    keys: Vec<RsaPublicKey>,
}

impl PayloadVerifier {
    pub fn new(keys: Vec<RsaPublicKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::NoPublicKeys);
        }

        for key in &keys {
            check_key_size(key.size())?;
        }

        Ok(Self { keys })
    }

    pub fn from_certs<'a>(certs: impl IntoIterator<Item = &'a Certificate>) -> Result<Self> {
        let keys = certs
            .into_iter()
            .map(get_public_key)
            .collect::<Result<Vec<_>>>()?;

        Self::new(keys)
    }

    pub fn keys(&self) -> &[RsaPublicKey] {
        &self.keys
    }

    /// Verify a single raw signature over `digest`. On failure, the error
    /// carries the decrypted signature of the last key tried so that callers
    /// can log it.
    pub fn verify_raw_signature(&self, signature: &[u8], digest: &[u8]) -> Result<()> {
        if digest.len() != SHA256_DIGEST_SIZE {
            return Err(Error::InvalidDigestLength(digest.len()));
        }

        let prefix = Pkcs1v15Sign::new::<Sha256>().prefix;
        let mut decrypted = Vec::new();

        for key in &self.keys {
            let Some(data) = rsa_public_decrypt(key, signature) else {
                continue;
            };

            // Every trusted key is at least large enough for the padding.
            if let Ok(expected) = pkcs1v15_sign_pad(&prefix, digest, key.size()) {
                if data == expected {
                    return Ok(());
                }
            }

            decrypted = data;
        }

        Err(Error::SignatureMismatch { decrypted })
    }

    /// Verify a serialized [`Signatures`] container. Succeeds if any of its
    /// signatures was produced by any of the trusted keys.
    pub fn verify_signature(&self, container: &[u8], digest: &[u8]) -> Result<()> {
        let signatures = Signatures::decode(container).map_err(Error::SignaturesDecode)?;
        let mut last_error = None;

        for signature in &signatures.signatures {
            let Some(data) = &signature.data else {
                continue;
            };
            let without_padding = match signature.unpadded_signature_size {
                Some(size) => match data.get(..size as usize) {
                    Some(d) => d,
                    None => continue,
                },
                None => data.as_slice(),
            };

            match self.verify_raw_signature(without_padding, digest) {
                Ok(()) => return Ok(()),
                Err(e @ Error::InvalidDigestLength(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or(Error::NoSignatures))
    }
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace. Release keys distributed with
/// devices do not always follow this.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for mut line in data.split(|&c| c == b'\n') {
        while let [rest @ .., last] = line {
            if !last.is_ascii_whitespace() {
                break;
            }
            line = rest;
        }

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

/// Read PEM-encoded certificate from a reader.
pub fn read_pem_cert(path: &Path, mut reader: impl Read) -> Result<Certificate> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let data = reformat_pem(&data)?;
    let certificate = Certificate::from_pem(data).map_err(Error::LoadCert)?;

    Ok(certificate)
}

/// Read PEM-encoded certificate from a file.
pub fn read_pem_cert_file(path: &Path) -> Result<Certificate> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_cert(path, reader)
}

/// Read PEM-encoded PKCS8 public key from a reader.
pub fn read_pem_public_key(path: &Path, mut reader: impl Read) -> Result<RsaPublicKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let key = RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPubKey)?;

    Ok(key)
}

/// Read PEM-encoded PKCS8 public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_public_key(path, reader)
}

/// Get the RSA public key from a certificate.
pub fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let public_key =
        RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
            .map_err(Error::LoadPubKey)?;

    Ok(public_key)
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use assert_matches::assert_matches;
    use prost::Message;
    use ring::digest::{SHA256, digest};

    use crate::protobuf::chromeos_update_engine::signatures::Signature;

    use super::*;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    fn other_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    #[test]
    fn raw_signature() {
        let key = test_key();
        let hash = digest(&SHA256, b"metadata");
        let signature = sign_raw(key, hash.as_ref()).unwrap();
        assert_eq!(signature.len(), key.size());

        let verifier = PayloadVerifier::new(vec![key.to_public_key()]).unwrap();
        verifier
            .verify_raw_signature(&signature, hash.as_ref())
            .unwrap();

        let other = digest(&SHA256, b"tampered");
        assert_matches!(
            verifier.verify_raw_signature(&signature, other.as_ref()),
            Err(Error::SignatureMismatch { decrypted }) if decrypted.len() == key.size()
        );
        assert_matches!(
            verifier.verify_raw_signature(&signature, &[0u8; 20]),
            Err(Error::InvalidDigestLength(20))
        );
    }

    #[test]
    fn any_trusted_key() {
        let hash = digest(&SHA256, b"metadata");
        let signature = sign_raw(test_key(), hash.as_ref()).unwrap();

        let verifier = PayloadVerifier::new(vec![
            other_key().to_public_key(),
            test_key().to_public_key(),
        ])
        .unwrap();
        verifier
            .verify_raw_signature(&signature, hash.as_ref())
            .unwrap();

        let untrusted = PayloadVerifier::new(vec![other_key().to_public_key()]).unwrap();
        assert_matches!(
            untrusted.verify_raw_signature(&signature, hash.as_ref()),
            Err(Error::SignatureMismatch { .. })
        );
    }

    #[test]
    fn signature_container() {
        let key = test_key();
        let hash = digest(&SHA256, b"metadata");
        let raw = sign_raw(key, hash.as_ref()).unwrap();

        let mut padded = raw.clone();
        padded.resize(raw.len() + 16, 0);

        let container = Signatures {
            signatures: vec![
                Signature {
                    version: None,
                    data: Some(vec![0x55; 8]),
                    unpadded_signature_size: Some(64),
                },
                Signature {
                    version: None,
                    data: Some(padded),
                    unpadded_signature_size: Some(raw.len() as u32),
                },
            ],
        }
        .encode_to_vec();

        let verifier = PayloadVerifier::new(vec![key.to_public_key()]).unwrap();
        verifier.verify_signature(&container, hash.as_ref()).unwrap();

        let empty = Signatures::default().encode_to_vec();
        assert_matches!(
            verifier.verify_signature(&empty, hash.as_ref()),
            Err(Error::NoSignatures)
        );
        assert_matches!(
            verifier.verify_signature(&[0xff, 0xff], hash.as_ref()),
            Err(Error::SignaturesDecode(_))
        );
    }

    #[test]
    fn no_keys() {
        assert_matches!(PayloadVerifier::new(vec![]), Err(Error::NoPublicKeys));
    }

    #[test]
    fn pem_without_end_tag() {
        let data = b"-----BEGIN CERTIFICATE-----\nAAAA\n";
        assert_matches!(reformat_pem(data), Err(Error::PemNoEndTag));
    }
}
