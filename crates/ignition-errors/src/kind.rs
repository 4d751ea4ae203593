//! Error kind classification and the CLI exit-code mapping.

use core::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of failure kinds propagated through the engine.
///
/// Kinds are persisted in history rows and uploaded reports, so the wire
/// names (`kebab-case`) are part of the stable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Caller supplied a malformed selector, flag combination, version or path
    InvalidArgs,
    /// Cabinet or metadata failed structural parse
    InvalidFile,
    /// A detached signature did not verify
    SignatureInvalid,
    /// Plugin or device lacks a required capability, or a requirement failed
    NotSupported,
    /// Device-id, GUID or remote-id unknown
    NotFound,
    /// Operation short-circuited because state already matches
    NothingToDo,
    /// User declined a confirmation or lacks authority
    PermissionDenied,
    /// Plugin returned an inconsistent state
    Internal,
    /// Replug or operation deadline elapsed
    Timeout,
    /// Policy check failed
    AuthFailed,
    /// Network or broker unreachable
    NotReachable,
    /// Device refused a read
    ReadProtected,
    /// Device refused a write
    WriteProtected,
    /// Guard rail: battery level too low to flash
    BatteryLow,
    /// Guard rail: AC power required
    AcPowerRequired,
    /// Guard rail: lid must be open
    LidClosed,
    /// A second engine instance holds the state lock
    AnotherInstanceRunning,
}

impl ErrorKind {
    /// Map the kind onto the stable CLI exit-code contract.
    pub fn exit_code(self) -> ExitCode {
        match self {
            ErrorKind::NothingToDo => ExitCode::NothingToDo,
            ErrorKind::NotReachable => ExitCode::NotReachable,
            ErrorKind::NotFound => ExitCode::NotFound,
            _ => ExitCode::Error,
        }
    }

    /// Guard-rail problems are transient: retrying later may succeed
    /// without any operator intervention.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::BatteryLow | ErrorKind::AcPowerRequired | ErrorKind::LidClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgs => "invalid-args",
            ErrorKind::InvalidFile => "invalid-file",
            ErrorKind::SignatureInvalid => "signature-invalid",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::NotFound => "not-found",
            ErrorKind::NothingToDo => "nothing-to-do",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Internal => "internal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AuthFailed => "auth-failed",
            ErrorKind::NotReachable => "not-reachable",
            ErrorKind::ReadProtected => "read-protected",
            ErrorKind::WriteProtected => "write-protected",
            ErrorKind::BatteryLow => "battery-low",
            ErrorKind::AcPowerRequired => "ac-power-required",
            ErrorKind::LidClosed => "lid-closed",
            ErrorKind::AnotherInstanceRunning => "another-instance-running",
        };
        f.write_str(name)
    }
}

/// Process exit codes of the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation completed
    Success = 0,
    /// Operation failed
    Error = 1,
    /// Nothing needed doing
    NothingToDo = 2,
    /// A remote or broker was unreachable
    NotReachable = 3,
    /// The requested device, release or remote does not exist
    NotFound = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ErrorKind::NothingToDo.exit_code(), ExitCode::NothingToDo);
        assert_eq!(ErrorKind::NotReachable.exit_code(), ExitCode::NotReachable);
        assert_eq!(ErrorKind::NotFound.exit_code(), ExitCode::NotFound);
        assert_eq!(ErrorKind::WriteProtected.exit_code(), ExitCode::Error);
        assert_eq!(i32::from(ExitCode::NotFound), 4);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::BatteryLow.is_transient());
        assert!(ErrorKind::LidClosed.is_transient());
        assert!(!ErrorKind::Internal.is_transient());
    }

    #[test]
    fn test_wire_names_are_kebab_case() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ErrorKind::SignatureInvalid)?;
        assert_eq!(json, "\"signature-invalid\"");
        assert_eq!(ErrorKind::AcPowerRequired.to_string(), "ac-power-required");
        Ok(())
    }
}
