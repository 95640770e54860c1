//! Tests for error handling

use std::io;

use trapdoor_core::error::{DebuggerError, Result};
use trapdoor_core::types::Address;

#[test]
fn test_debugger_error_display()
{
    let error = DebuggerError::ProcessNotFound(12345);
    let message = format!("{}", error);
    assert!(message.contains("12345"));
    assert!(message.contains("not found"));
}

#[test]
fn test_os_error_names_operation()
{
    let error = DebuggerError::os("write_memory", io::Error::from_raw_os_error(libc::EIO));
    let message = error.to_string();
    assert!(message.starts_with("write_memory failed"));
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn test_partial_copy_display()
{
    let error = DebuggerError::PartialCopy {
        address: Address::new(0x1000),
        requested: 16,
        transferred: 4,
    };
    let message = error.to_string();
    assert!(message.contains("0x0000000000001000"));
    assert!(message.contains("4 of 16"));
}

#[test]
fn test_state_errors()
{
    assert!(DebuggerError::WrongState("process 7 is running".into())
        .to_string()
        .contains("running"));
    assert_eq!(DebuggerError::ProcessEnded(7).to_string(), "Process 7 has ended");
    assert!(DebuggerError::Decode {
        address: Address::new(0x40)
    }
    .to_string()
    .contains("Cannot decode"));
}

#[test]
fn test_access_denied_classification()
{
    assert!(DebuggerError::PermissionDenied("exiting".into()).is_access_denied());
    assert!(DebuggerError::os("suspend_thread", io::Error::from(io::ErrorKind::PermissionDenied)).is_access_denied());
    assert!(!DebuggerError::ProcessEnded(1).is_access_denied());
    assert!(!DebuggerError::InvalidArgument("x".into()).is_access_denied());
}

#[cfg(target_os = "linux")]
#[test]
fn test_nix_errors_convert()
{
    let error: DebuggerError = nix::errno::Errno::ESRCH.into();
    assert!(matches!(error, DebuggerError::Nix(_)));
    // a task on its way out
    assert!(error.is_access_denied());

    let error: DebuggerError = nix::errno::Errno::EINVAL.into();
    assert!(!error.is_access_denied());
}

#[test]
fn test_io_error_conversion()
{
    let io_error = io::Error::new(io::ErrorKind::NotFound, "no /proc entry");
    let error: DebuggerError = io_error.into();
    assert!(matches!(error, DebuggerError::Io(_)));
    assert!(error.to_string().contains("no /proc entry"));
}

#[test]
fn test_result_alias()
{
    fn fails() -> Result<u8>
    {
        Err(DebuggerError::NotFound("thread 9".into()))
    }

    fn succeeds() -> Result<u8>
    {
        Ok(1)
    }

    assert!(fails().is_err());
    assert_eq!(succeeds().unwrap(), 1);
}
