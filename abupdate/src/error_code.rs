// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

/// Result of an update attempt or of one of its steps. The numeric values are
/// the ones reported to the platform and must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    Error,
    PostinstallRunnerError,
    PostinstallBootedFromFirmwareB,
    NewRootfsVerificationError,
    DownloadStateInitializationError,
    DownloadInvalidMetadataMagicString,
    DownloadManifestParseError,
    DownloadMetadataSignatureError,
    DownloadMetadataSignatureVerificationError,
    DownloadMetadataSignatureMismatch,
    DownloadInvalidMetadataSize,
    DownloadMetadataSignatureMissingError,
    PostinstallPowerwashError,
    PostinstallFirmwareRONotUpdatable,
    UnsupportedMajorPayloadVersion,
    FilesystemVerifierError,
    UserCanceled,
    UpdatedButNotActive,
    PostInstallMountError,
    /// The postinstall program path is absolute or escapes the mount root.
    /// Reported with the generic runner error number so that consumers that
    /// only know the platform codes still see a postinstall failure.
    PostinstallInvalidPath,
}

/// Coarse classification used to pick a remedial action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Success,
    Format,
    Signature,
    /// A written partition does not match the manifest.
    Verification,
    Mount,
    Configuration,
    Runner,
    FirmwareSlot,
    Powerwash,
    Canceled,
    Other,
}

impl ErrorCode {
    pub const ALL: [Self; 21] = [
        Self::Success,
        Self::Error,
        Self::PostinstallRunnerError,
        Self::PostinstallBootedFromFirmwareB,
        Self::NewRootfsVerificationError,
        Self::DownloadStateInitializationError,
        Self::DownloadInvalidMetadataMagicString,
        Self::DownloadManifestParseError,
        Self::DownloadMetadataSignatureError,
        Self::DownloadMetadataSignatureVerificationError,
        Self::DownloadMetadataSignatureMismatch,
        Self::DownloadInvalidMetadataSize,
        Self::DownloadMetadataSignatureMissingError,
        Self::PostinstallPowerwashError,
        Self::PostinstallFirmwareRONotUpdatable,
        Self::UnsupportedMajorPayloadVersion,
        Self::FilesystemVerifierError,
        Self::UserCanceled,
        Self::UpdatedButNotActive,
        Self::PostInstallMountError,
        Self::PostinstallInvalidPath,
    ];

    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::PostinstallRunnerError => 5,
            Self::NewRootfsVerificationError => 15,
            Self::PostinstallBootedFromFirmwareB => 19,
            Self::DownloadStateInitializationError => 20,
            Self::DownloadInvalidMetadataMagicString => 21,
            Self::DownloadManifestParseError => 23,
            Self::DownloadMetadataSignatureError => 24,
            Self::DownloadMetadataSignatureVerificationError => 25,
            Self::DownloadMetadataSignatureMismatch => 26,
            Self::DownloadInvalidMetadataSize => 32,
            Self::DownloadMetadataSignatureMissingError => 39,
            Self::PostinstallPowerwashError => 41,
            Self::PostinstallFirmwareRONotUpdatable => 43,
            Self::UnsupportedMajorPayloadVersion => 44,
            Self::FilesystemVerifierError => 47,
            Self::UserCanceled => 48,
            Self::UpdatedButNotActive => 52,
            Self::PostInstallMountError => 63,
            Self::PostinstallInvalidPath => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::PostinstallRunnerError => "PostinstallRunnerError",
            Self::PostinstallBootedFromFirmwareB => "PostinstallBootedFromFirmwareB",
            Self::NewRootfsVerificationError => "NewRootfsVerificationError",
            Self::DownloadStateInitializationError => "DownloadStateInitializationError",
            Self::DownloadInvalidMetadataMagicString => "DownloadInvalidMetadataMagicString",
            Self::DownloadManifestParseError => "DownloadManifestParseError",
            Self::DownloadMetadataSignatureError => "DownloadMetadataSignatureError",
            Self::DownloadMetadataSignatureVerificationError => {
                "DownloadMetadataSignatureVerificationError"
            }
            Self::DownloadMetadataSignatureMismatch => "DownloadMetadataSignatureMismatch",
            Self::DownloadInvalidMetadataSize => "DownloadInvalidMetadataSize",
            Self::DownloadMetadataSignatureMissingError => "DownloadMetadataSignatureMissingError",
            Self::PostinstallPowerwashError => "PostinstallPowerwashError",
            Self::PostinstallFirmwareRONotUpdatable => "PostinstallFirmwareRONotUpdatable",
            Self::UnsupportedMajorPayloadVersion => "UnsupportedMajorPayloadVersion",
            Self::FilesystemVerifierError => "FilesystemVerifierError",
            Self::UserCanceled => "UserCanceled",
            Self::UpdatedButNotActive => "UpdatedButNotActive",
            Self::PostInstallMountError => "PostInstallMountError",
            Self::PostinstallInvalidPath => "PostinstallInvalidPath",
        }
    }

    /// Whether the attempt should be considered successful. A completed
    /// update that did not switch slots is still a success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::UpdatedButNotActive)
    }

    pub fn class(self) -> ErrorClass {
        match self {
            Self::Success | Self::UpdatedButNotActive => ErrorClass::Success,
            Self::DownloadInvalidMetadataMagicString
            | Self::DownloadManifestParseError
            | Self::DownloadInvalidMetadataSize
            | Self::UnsupportedMajorPayloadVersion => ErrorClass::Format,
            Self::DownloadMetadataSignatureError
            | Self::DownloadMetadataSignatureVerificationError
            | Self::DownloadMetadataSignatureMismatch
            | Self::DownloadMetadataSignatureMissingError => ErrorClass::Signature,
            Self::NewRootfsVerificationError | Self::FilesystemVerifierError => {
                ErrorClass::Verification
            }
            Self::PostInstallMountError => ErrorClass::Mount,
            Self::PostinstallInvalidPath | Self::DownloadStateInitializationError => {
                ErrorClass::Configuration
            }
            Self::PostinstallRunnerError => ErrorClass::Runner,
            Self::PostinstallBootedFromFirmwareB | Self::PostinstallFirmwareRONotUpdatable => {
                ErrorClass::FirmwareSlot
            }
            Self::PostinstallPowerwashError => ErrorClass::Powerwash,
            Self::UserCanceled => ErrorClass::Canceled,
            Self::Error => ErrorClass::Other,
        }
    }

    /// Whether retrying the same payload can succeed without any external
    /// change. Format, signature, and configuration problems are properties
    /// of the payload itself.
    pub fn is_retryable(self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Mount | ErrorClass::Powerwash | ErrorClass::Canceled | ErrorClass::Other
        )
    }

    /// Whether the device must first reboot into the other firmware slot.
    pub fn requires_reboot(self) -> bool {
        self.class() == ErrorClass::FirmwareSlot
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
