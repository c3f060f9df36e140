//! Error handling and display for the CLI.

use colored::Colorize;
use d8_mirror::{LayoutError, PullStepError, RegistryError, ServiceError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("--source-login and --source-password must be given together")]
    IncompleteLogin,

    #[error("No credentials given: pass --license, or --source-login with --source-password")]
    NoCredentials,

    #[error("Nothing to mirror: installer and security databases are both disabled")]
    NothingToMirror,
}

/// Find the registry error at the bottom of a chain, looking through the
/// transparent wrappers that hide it from `source()`.
fn registry_error(err: &anyhow::Error) -> Option<&RegistryError> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<RegistryError>() {
            return Some(e);
        }
        match cause.downcast_ref::<ServiceError>() {
            Some(ServiceError::Registry(e)) | Some(ServiceError::Unreachable { source: e, .. }) => {
                return Some(e);
            }
            _ => {}
        }
        match cause.downcast_ref::<PullStepError>() {
            Some(PullStepError::Registry(e)) => Some(e),
            _ => None,
        }
    })
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(service_err) = err.downcast_ref::<ServiceError>() {
        if service_err.is_cancelled() {
            return Some("Interrupted. Rerun the same command to resume; images already written are kept.");
        }
    }

    if let Some(RegistryError::AuthRequired(_)) = registry_error(err) {
        return Some(
            "Hint: Pass --license or --source-login/--source-password, or store them with `d8 mirror login`.",
        );
    }

    if let Some(ServiceError::Unreachable { .. }) = err.downcast_ref::<ServiceError>() {
        return Some(
            "Hint: Check network access to the source registry. Use --insecure for plain-HTTP registries.",
        );
    }

    match err.downcast_ref::<LayoutError>() {
        Some(LayoutError::ImageMetaNotFound { .. }) | Some(LayoutError::ImageNotFound { .. }) => {
            Some("Hint: Run `d8 mirror ls <layout-dir>` to see what the layout holds.")
        }
        Some(LayoutError::NotALayout { .. }) => {
            Some("Hint: Point at a directory written by `d8 mirror pull`, e.g. <dir>/installer.")
        }
        _ => None,
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);
    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
    }

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", hint.yellow());
    }
}
