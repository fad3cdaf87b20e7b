// SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read};

use base64::{Engine, engine::general_purpose::STANDARD};
use num_traits::ToPrimitive;
use prost::Message;
use ring::digest::{self, SHA256};
use rsa::{RsaPrivateKey, traits::PublicKeyParts};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    crypto::{self, PayloadVerifier},
    error_code::ErrorCode,
    protobuf::chromeos_update_engine::{DeltaArchiveManifest, Signatures, signatures::Signature},
    util,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

pub const MIN_SUPPORTED_MAJOR_VERSION: u64 = 2;
pub const MAX_SUPPORTED_MAJOR_VERSION: u64 = 2;

const VERSION_OFFSET: usize = PAYLOAD_MAGIC.len();
const VERSION_SIZE: usize = 8;
const MANIFEST_SIZE_OFFSET: usize = VERSION_OFFSET + VERSION_SIZE;
const MANIFEST_SIZE_SIZE: usize = 8;
const METADATA_SIGNATURE_SIZE_OFFSET: usize = MANIFEST_SIZE_OFFSET + MANIFEST_SIZE_SIZE;
const METADATA_SIGNATURE_SIZE_SIZE: usize = 4;

/// Size of the fixed header. The manifest immediately follows it.
pub const MAX_PAYLOAD_HEADER_SIZE: usize =
    METADATA_SIGNATURE_SIZE_OFFSET + METADATA_SIGNATURE_SIZE_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {}, expected: {}", hex::encode(.0), hex::encode(PAYLOAD_MAGIC))]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload major version: {0}")]
    UnsupportedVersion(u64),
    #[error("Overflow detected in {0}")]
    MetadataSizeOverflow(&'static str),
    #[error("Payload is too small for metadata signature: need {0} bytes, but have {1}")]
    PayloadTooSmall(u64, u64),
    #[error("Failed to decode base64 metadata signature: {0:?}")]
    SignatureBase64(String, #[source] base64::DecodeError),
    #[error("Missing mandatory metadata signature in both the request and the payload")]
    MissingSignature,
    #[error("Failed to compute metadata hash")]
    HashVerification(#[source] crypto::Error),
    #[error("Metadata hash signature does not match")]
    SignatureMismatch(#[source] crypto::Error),
    #[error("Invalid metadata size: {0}")]
    InvalidMetadataSize(u64),
    #[error("Metadata hash mismatch: expected {expected}, but have {actual}")]
    MetadataHashMismatch { expected: String, actual: String },
    #[error("Failed to decode manifest")]
    ManifestDecode(#[source] prost::DecodeError),
    #[error("Failed to decode metadata signatures")]
    SignaturesDecode(#[source] prost::DecodeError),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownMagic(_) => ErrorCode::DownloadInvalidMetadataMagicString,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedMajorPayloadVersion,
            Self::MetadataSizeOverflow(_) => ErrorCode::DownloadInvalidMetadataSize,
            Self::PayloadTooSmall(_, _) | Self::SignatureBase64(_, _) => {
                ErrorCode::DownloadMetadataSignatureError
            }
            Self::MissingSignature => ErrorCode::DownloadMetadataSignatureMissingError,
            Self::HashVerification(_) => ErrorCode::DownloadMetadataSignatureVerificationError,
            Self::SignatureMismatch(_) => ErrorCode::DownloadMetadataSignatureMismatch,
            Self::InvalidMetadataSize(_)
            | Self::MetadataHashMismatch { .. }
            | Self::ManifestDecode(_)
            | Self::SignaturesDecode(_)
            | Self::IntegerTooLarge(_)
            | Self::Io(_) => ErrorCode::DownloadManifestParseError,
            Self::Crypto(_) => ErrorCode::Error,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of parsing a possibly incomplete buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseStatus<T> {
    Complete(T),
    /// More bytes are needed. The caller should retry with a longer buffer.
    InsufficientData,
}

/// Sizes and offsets from the fixed payload header. All derived sums are
/// checked for overflow during parsing, so the accessors never wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadMetadata {
    pub major_version: u64,
    pub manifest_size: u64,
    pub metadata_size: u64,
    pub metadata_signature_size: u32,
}

fn read_be_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

fn read_be_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

impl PayloadMetadata {
    /// Parse the fixed header at the start of `data`. Nothing beyond the
    /// header is examined.
    pub fn parse_header(data: &[u8]) -> Result<ParseStatus<Self>> {
        // The magic is only checked once the version field is available.
        if data.len() < MANIFEST_SIZE_OFFSET {
            return Ok(ParseStatus::InsufficientData);
        }

        if &data[..PAYLOAD_MAGIC.len()] != PAYLOAD_MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&data[..PAYLOAD_MAGIC.len()]);

            let e = Error::UnknownMagic(magic);
            error!("Bad payload format: {e}");
            return Err(e);
        }

        if data.len() < MAX_PAYLOAD_HEADER_SIZE {
            return Ok(ParseStatus::InsufficientData);
        }

        let major_version = read_be_u64(data, VERSION_OFFSET);
        if !(MIN_SUPPORTED_MAJOR_VERSION..=MAX_SUPPORTED_MAJOR_VERSION).contains(&major_version) {
            error!("Bad payload format: unsupported payload version: {major_version}");
            return Err(Error::UnsupportedVersion(major_version));
        }

        let manifest_size = read_be_u64(data, MANIFEST_SIZE_OFFSET);
        let metadata_size = Self::MANIFEST_OFFSET
            .checked_add(manifest_size)
            .ok_or(Error::MetadataSizeOverflow("manifest size"))?;

        let metadata_signature_size = read_be_u32(data, METADATA_SIGNATURE_SIZE_OFFSET);
        metadata_size
            .checked_add(metadata_signature_size.into())
            .ok_or(Error::MetadataSizeOverflow("metadata and signature size"))?;

        Ok(ParseStatus::Complete(Self {
            major_version,
            manifest_size,
            metadata_size,
            metadata_signature_size,
        }))
    }

    /// Offset of the manifest for the supported major version.
    pub const MANIFEST_OFFSET: u64 = MAX_PAYLOAD_HEADER_SIZE as u64;

    pub fn manifest_offset(&self) -> u64 {
        Self::MANIFEST_OFFSET
    }

    /// Size of the metadata plus the signature blob that follows it.
    pub fn total_size(&self) -> u64 {
        self.metadata_size + u64::from(self.metadata_signature_size)
    }

    /// Get the raw manifest bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not contain the full manifest. Callers must only
    /// pass buffers at least [`Self::metadata_size`] bytes long.
    pub fn manifest_bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let end = self.metadata_size.to_usize().filter(|n| *n <= data.len());
        assert!(
            end.is_some(),
            "Buffer ({} bytes) does not contain the manifest ({} bytes)",
            data.len(),
            self.metadata_size,
        );

        &data[MAX_PAYLOAD_HEADER_SIZE..end.unwrap_or_default()]
    }

    /// Deserialize the manifest. See [`Self::manifest_bytes`] for the
    /// precondition on `data`.
    pub fn manifest(&self, data: &[u8]) -> Result<DeltaArchiveManifest> {
        DeltaArchiveManifest::decode(self.manifest_bytes(data)).map_err(Error::ManifestDecode)
    }

    /// Validate the metadata signature. If `metadata_signature` is non-empty,
    /// it is a base64-encoded raw signature that takes precedence over the
    /// signature blob stored in the payload after the metadata.
    pub fn validate_metadata_signature(
        &self,
        payload: &[u8],
        metadata_signature: &str,
        verifier: &PayloadVerifier,
    ) -> Result<()> {
        let have = payload
            .len()
            .to_u64()
            .ok_or(Error::IntegerTooLarge("payload_size"))?;
        if have < self.total_size() {
            return Err(Error::PayloadTooSmall(self.total_size(), have));
        }

        // Both fit in usize since they are within the bounds of the slice.
        let metadata_size = self.metadata_size as usize;
        let total_size = self.total_size() as usize;

        let raw_signature = if metadata_signature.is_empty() {
            vec![]
        } else {
            STANDARD.decode(metadata_signature).map_err(|e| {
                let e = Error::SignatureBase64(metadata_signature.to_owned(), e);
                error!("Unable to decode metadata signature: {e}");
                e
            })?
        };
        let container = if raw_signature.is_empty() {
            &payload[metadata_size..total_size]
        } else {
            &[][..]
        };

        if raw_signature.is_empty() && container.is_empty() {
            error!("{}", Error::MissingSignature);
            return Err(Error::MissingSignature);
        }

        let hash = digest::digest(&SHA256, &payload[..metadata_size]);
        if hash.as_ref().len() != crypto::SHA256_DIGEST_SIZE {
            error!("Computed metadata hash has incorrect size: {}", hash.as_ref().len());
            return Err(Error::HashVerification(crypto::Error::InvalidDigestLength(
                hash.as_ref().len(),
            )));
        }

        let result = if raw_signature.is_empty() {
            verifier.verify_signature(container, hash.as_ref())
        } else {
            verifier.verify_raw_signature(&raw_signature, hash.as_ref())
        };

        match result {
            Ok(()) => {}
            Err(e @ crypto::Error::InvalidDigestLength(_)) => {
                return Err(Error::HashVerification(e));
            }
            Err(e) => {
                error!("Metadata hash verification failed: {e}");
                if let crypto::Error::SignatureMismatch { decrypted } = &e {
                    error!("Decrypted hash:");
                    util::log_hex_dump(decrypted);
                    error!("Calculated hash before padding:");
                    util::log_hex_dump(hash.as_ref());
                }
                return Err(Error::SignatureMismatch(e));
            }
        }

        info!("Metadata hash signature matches trusted key");

        Ok(())
    }
}

/// Read the header, metadata, and metadata signature from the start of a
/// payload. Metadata claiming to be larger than `source_size` is rejected
/// before allocating a buffer for it.
pub fn read_metadata(
    mut reader: impl Read,
    source_size: u64,
) -> Result<(PayloadMetadata, Vec<u8>)> {
    let mut data = vec![0u8; MAX_PAYLOAD_HEADER_SIZE];
    reader.read_exact(&mut data)?;

    let header = match PayloadMetadata::parse_header(&data)? {
        ParseStatus::Complete(h) => h,
        // A full header is always available here.
        ParseStatus::InsufficientData => {
            return Err(Error::InvalidMetadataSize(data.len() as u64));
        }
    };

    let total_size = header.total_size();
    if total_size < PayloadMetadata::MANIFEST_OFFSET || total_size > source_size {
        return Err(Error::InvalidMetadataSize(total_size));
    }

    let total_size = total_size
        .to_usize()
        .ok_or(Error::IntegerTooLarge("metadata_size"))?;
    data.resize(total_size, 0);
    reader.read_exact(&mut data[MAX_PAYLOAD_HEADER_SIZE..])?;

    debug!(
        "Read payload metadata: manifest={} bytes, signature={} bytes",
        header.manifest_size, header.metadata_signature_size,
    );

    Ok((header, data))
}

/// Verify the metadata read by [`read_metadata`] and return its manifest. If
/// `expected_hash` is provided, the SHA-256 digest of the metadata must match
/// it before the signature is even checked.
pub fn verify_and_parse(
    header: &PayloadMetadata,
    data: &[u8],
    metadata_signature: &str,
    expected_hash: Option<&[u8]>,
    verifier: &PayloadVerifier,
) -> Result<DeltaArchiveManifest> {
    if let Some(expected) = expected_hash {
        let metadata = data
            .get(..header.metadata_size as usize)
            .ok_or(Error::InvalidMetadataSize(header.metadata_size))?;
        let actual = digest::digest(&SHA256, metadata);

        if actual.as_ref() != expected {
            return Err(Error::MetadataHashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        info!("Payload metadata hash check passed: {}", hex::encode(actual));
    }

    header.validate_metadata_signature(data, metadata_signature, verifier)?;

    header.manifest(data)
}

/// Fully decoded payload metadata.
#[derive(Clone, Debug)]
pub struct PayloadInfo {
    pub header: PayloadMetadata,
    pub manifest: DeltaArchiveManifest,
    pub signatures: Signatures,
}

/// Read and decode the metadata from a payload without verifying it.
pub fn read_payload_info(reader: impl Read, source_size: u64) -> Result<PayloadInfo> {
    let (header, data) = read_metadata(reader, source_size)?;
    let manifest = header.manifest(&data)?;
    let signatures = Signatures::decode(&data[header.metadata_size as usize..])
        .map_err(Error::SignaturesDecode)?;

    Ok(PayloadInfo {
        header,
        manifest,
        signatures,
    })
}

/// Sign a digest and wrap the signature, padded to the key size, in a
/// [`Signatures`] container.
pub fn sign_digest(digest: &[u8], key: &RsaPrivateKey) -> Result<Signatures> {
    let mut digest_signed = crypto::sign_raw(key, digest)?;
    assert!(
        digest_signed.len() <= key.size(),
        "Signature exceeds maximum size",
    );

    let unpadded_size = digest_signed.len();
    digest_signed.resize(key.size(), 0);

    let signature = Signature {
        version: None,
        data: Some(digest_signed),
        // Always fits in even a u16.
        unpadded_signature_size: Some(unpadded_size as u32),
    };

    Ok(Signatures {
        signatures: vec![signature],
    })
}

fn build_header(manifest_size: u64, metadata_signature_size: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(MAX_PAYLOAD_HEADER_SIZE);
    data.extend_from_slice(PAYLOAD_MAGIC);
    data.extend_from_slice(&MAX_SUPPORTED_MAJOR_VERSION.to_be_bytes());
    data.extend_from_slice(&manifest_size.to_be_bytes());
    data.extend_from_slice(&metadata_signature_size.to_be_bytes());
    data
}

/// Serialize `manifest` into payload metadata followed by a signature blob
/// signed by `key`. The output can be passed to [`read_metadata`].
pub fn write_signed_metadata(
    manifest: &DeltaArchiveManifest,
    key: &RsaPrivateKey,
) -> Result<Vec<u8>> {
    let manifest_raw = manifest.encode_to_vec();
    let manifest_size = manifest_raw
        .len()
        .to_u64()
        .ok_or(Error::IntegerTooLarge("manifest_size"))?;

    // The container size only depends on the key size since signatures are
    // padded to it.
    let dummy = sign_digest(&[0u8; crypto::SHA256_DIGEST_SIZE], key)?;
    let signature_size = dummy
        .encoded_len()
        .to_u32()
        .ok_or(Error::IntegerTooLarge("metadata_signature_size"))?;

    let mut data = build_header(manifest_size, signature_size);
    data.extend_from_slice(&manifest_raw);

    let hash = digest::digest(&SHA256, &data);
    let signatures = sign_digest(hash.as_ref(), key)?;
    let signatures_raw = signatures.encode_to_vec();
    assert_eq!(
        signatures_raw.len(),
        signature_size as usize,
        "Signature container size changed",
    );

    data.extend_from_slice(&signatures_raw);

    Ok(data)
}

/// Produce a base64-encoded raw signature of the metadata in `data`, suitable
/// for passing out of band to [`PayloadMetadata::validate_metadata_signature`].
pub fn sign_metadata_raw(
    header: &PayloadMetadata,
    data: &[u8],
    key: &RsaPrivateKey,
) -> Result<String> {
    let metadata = data
        .get(..header.metadata_size as usize)
        .ok_or(Error::InvalidMetadataSize(header.metadata_size))?;
    let hash = digest::digest(&SHA256, metadata);
    let signature = crypto::sign_raw(key, hash.as_ref())?;

    Ok(STANDARD.encode(signature))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn header(version: u64, manifest_size: u64, signature_size: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(PAYLOAD_MAGIC);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&manifest_size.to_be_bytes());
        data.extend_from_slice(&signature_size.to_be_bytes());
        data
    }

    #[test]
    fn header_layout() {
        assert_eq!(MAX_PAYLOAD_HEADER_SIZE, 24);
        assert_eq!(build_header(10, 20), header(2, 10, 20));
    }

    #[test]
    fn magic_checked_after_version_field() {
        let mut data = header(2, 0, 0);
        data[0] = b'X';

        assert_matches!(
            PayloadMetadata::parse_header(&data[..11]),
            Ok(ParseStatus::InsufficientData)
        );
        assert_matches!(
            PayloadMetadata::parse_header(&data[..12]),
            Err(Error::UnknownMagic(m)) if &m == b"XrAU"
        );
    }

    #[test]
    fn version_checked_after_full_header() {
        let data = header(1, 0, 0);

        assert_matches!(
            PayloadMetadata::parse_header(&data[..23]),
            Ok(ParseStatus::InsufficientData)
        );
        assert_matches!(
            PayloadMetadata::parse_header(&data),
            Err(Error::UnsupportedVersion(1))
        );
        assert_matches!(
            PayloadMetadata::parse_header(&header(3, 0, 0)),
            Err(Error::UnsupportedVersion(3))
        );
    }

    #[test]
    fn signature_size_overflow() {
        let data = header(2, u64::MAX - 24, 1);
        let err = PayloadMetadata::parse_header(&data).unwrap_err();

        assert_matches!(err, Error::MetadataSizeOverflow(_));
        assert_eq!(err.error_code(), ErrorCode::DownloadInvalidMetadataSize);

        assert_matches!(
            PayloadMetadata::parse_header(&header(2, u64::MAX - 24, 0)),
            Ok(ParseStatus::Complete(m)) if m.metadata_size == u64::MAX
        );
    }

    #[test]
    #[should_panic(expected = "does not contain the manifest")]
    fn manifest_precondition() {
        let data = header(2, 100, 0);
        let metadata = match PayloadMetadata::parse_header(&data).unwrap() {
            ParseStatus::Complete(m) => m,
            ParseStatus::InsufficientData => unreachable!(),
        };

        let _ = metadata.manifest_bytes(&data);
    }

    #[test]
    fn read_rejects_oversized_metadata() {
        let mut data = header(2, 1000, 0);
        data.extend_from_slice(&[0u8; 16]);

        assert_matches!(
            read_metadata(data.as_slice(), data.len() as u64),
            Err(Error::InvalidMetadataSize(1024))
        );
        assert_matches!(
            read_metadata(data.as_slice(), u64::MAX),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            Error::UnknownMagic(*b"abcd").error_code(),
            ErrorCode::DownloadInvalidMetadataMagicString,
        );
        assert_eq!(
            Error::MissingSignature.error_code(),
            ErrorCode::DownloadMetadataSignatureMissingError,
        );
        assert_eq!(
            Error::PayloadTooSmall(10, 5).error_code(),
            ErrorCode::DownloadMetadataSignatureError,
        );
        assert_eq!(
            Error::InvalidMetadataSize(5).error_code(),
            ErrorCode::DownloadManifestParseError,
        );
    }
}
