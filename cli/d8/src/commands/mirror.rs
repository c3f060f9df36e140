//! Mirror commands (offline image layouts).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use d8_mirror::oci::{Descriptor, ANNOTATION_REF_NAME, ANNOTATION_SHORT_TAG};
use d8_mirror::{
    CancelSignal, Digest, ImageLayout, ImageMeta, InstallerService, MirrorOptions, Progress,
    RegistryAuth, RetryPolicy, SecurityService, SourceRegistry,
};
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::config::Credentials;
use crate::error::CliError;
use crate::output::{print_output, print_result, print_success, OutputFormat};

use super::CommandContext;

/// Mirror commands.
#[derive(Debug, Args)]
pub struct MirrorCommand {
    #[command(subcommand)]
    command: MirrorSubcommand,
}

#[derive(Debug, Subcommand)]
enum MirrorSubcommand {
    /// Pull installer images and security databases into local layouts.
    Pull(PullArgs),

    /// List the images held by a layout.
    Ls(LsArgs),

    /// Point a new tag at an image already in a layout.
    Tag(TagArgs),

    /// Store source registry credentials.
    Login(LoginArgs),

    /// Remove stored source registry credentials.
    Logout,
}

/// Source registry credentials given on the command line.
#[derive(Debug, Default, Args)]
struct AuthArgs {
    /// Platform license token.
    #[arg(long, conflicts_with_all = ["source_login", "source_password"])]
    license: Option<String>,

    /// Source registry user name.
    #[arg(long)]
    source_login: Option<String>,

    /// Source registry password.
    #[arg(long)]
    source_password: Option<String>,
}

impl AuthArgs {
    /// Credentials named by flags, if any.
    fn credentials(&self) -> Result<Option<Credentials>, CliError> {
        match (&self.license, &self.source_login, &self.source_password) {
            (Some(token), _, _) => Ok(Some(Credentials::license(token.clone()))),
            (None, Some(login), Some(password)) => {
                Ok(Some(Credentials::login(login.clone(), password.clone())))
            }
            (None, None, None) => Ok(None),
            _ => Err(CliError::IncompleteLogin),
        }
    }
}

#[derive(Debug, Args)]
struct PullArgs {
    /// Working directory; layouts are created under it.
    dir: PathBuf,

    /// Source registry root, e.g. registry.deckhouse.io/deckhouse/ee.
    #[arg(long)]
    source: Option<String>,

    #[command(flatten)]
    auth: AuthArgs,

    /// Use plain HTTP for the source registry.
    #[arg(long)]
    insecure: bool,

    /// Installer tag to mirror; repeatable. Defaults to latest.
    #[arg(long = "installer-tag")]
    installer_tags: Vec<String>,

    /// Skip installer images.
    #[arg(long)]
    no_installer: bool,

    /// Skip security databases.
    #[arg(long)]
    no_security_db: bool,

    /// Attempts per network operation.
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Seconds to wait between attempts.
    #[arg(long, default_value_t = 10)]
    retry_delay: u64,
}

#[derive(Debug, Args)]
struct LsArgs {
    /// Layout directory, e.g. <dir>/installer.
    layout: PathBuf,
}

#[derive(Debug, Args)]
struct TagArgs {
    /// Layout directory.
    layout: PathBuf,

    /// Digest of the image to tag (sha256:...).
    digest: String,

    /// New tag.
    tag: String,
}

#[derive(Debug, Args)]
struct LoginArgs {
    #[command(flatten)]
    auth: AuthArgs,

    /// Also save this source registry as the default.
    #[arg(long)]
    source: Option<String>,
}

impl MirrorCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            MirrorSubcommand::Pull(args) => pull(ctx, args).await,
            MirrorSubcommand::Ls(args) => list(ctx, args).await,
            MirrorSubcommand::Tag(args) => tag(ctx, args).await,
            MirrorSubcommand::Login(args) => login(ctx, args),
            MirrorSubcommand::Logout => logout(),
        }
    }
}

/// One mirrored image in command output.
#[derive(Debug, Clone, Serialize, Tabled)]
struct ImageRow {
    #[tabled(rename = "Group")]
    group: String,

    #[tabled(rename = "Tag")]
    tag: String,

    #[tabled(rename = "Digest")]
    digest: String,

    #[tabled(rename = "Reference")]
    reference: String,
}

impl ImageRow {
    fn new(group: &str, meta: &ImageMeta) -> Self {
        Self {
            group: group.to_string(),
            tag: meta.tag.clone(),
            digest: meta.digest.to_string(),
            reference: meta.tag_reference.clone(),
        }
    }
}

/// One index descriptor in `ls` output.
#[derive(Debug, Clone, Serialize, Tabled)]
struct ManifestRow {
    #[tabled(rename = "Short tag")]
    short_tag: String,

    #[tabled(rename = "Reference")]
    reference: String,

    #[tabled(rename = "Digest")]
    digest: String,

    #[tabled(rename = "Size")]
    size: u64,
}

impl From<&Descriptor> for ManifestRow {
    fn from(desc: &Descriptor) -> Self {
        Self {
            short_tag: desc.annotation(ANNOTATION_SHORT_TAG).unwrap_or("-").to_string(),
            reference: desc.annotation(ANNOTATION_REF_NAME).unwrap_or("-").to_string(),
            digest: desc.digest.to_string(),
            size: desc.size,
        }
    }
}

/// Pull the enabled image groups.
async fn pull(ctx: CommandContext, args: PullArgs) -> Result<()> {
    if args.no_installer && args.no_security_db {
        return Err(CliError::NothingToMirror.into());
    }

    let auth = match args.auth.credentials()? {
        Some(creds) => creds.auth(),
        None => ctx
            .credentials
            .as_ref()
            .map(Credentials::auth)
            .unwrap_or(RegistryAuth::Anonymous),
    };
    let source = SourceRegistry::parse(args.source.as_deref().unwrap_or(&ctx.config.source));
    let options = MirrorOptions {
        auth,
        insecure: args.insecure || ctx.config.insecure,
        retry: RetryPolicy::new(args.retries, Duration::from_secs(args.retry_delay)),
        ..MirrorOptions::new(source, &args.dir)
    };
    let client = Arc::new(
        options
            .registry_client()
            .context("Failed to build registry client")?,
    );
    let progress = Progress::new(ctx.verbose);

    let (handle, cancel) = CancelSignal::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    info!(source = %options.source.root_url(), dir = %args.dir.display(), "Starting mirror pull");
    let mut rows = Vec::new();

    if !args.no_installer {
        let mut service = InstallerService::new(
            options.clone(),
            client.clone(),
            args.installer_tags,
            progress.clone(),
        )
        .await?;
        service.pull(&cancel).await?;
        for meta in service.layout().images().await {
            rows.push(ImageRow::new("installer", &meta));
        }
    }

    if !args.no_security_db {
        let mut service = SecurityService::new(options.clone(), client.clone(), progress.clone()).await?;
        service.pull(&cancel).await?;
        for mirror in service.databases() {
            for meta in mirror.layout.images().await {
                rows.push(ImageRow::new(mirror.database.name, &meta));
            }
        }
    }

    print_output(&rows, ctx.format);
    if matches!(ctx.format, OutputFormat::Table) {
        print_success(&format!(
            "Mirrored {} images into {}",
            rows.len(),
            args.dir.display()
        ));
    }
    Ok(())
}

/// List index descriptors of a layout.
async fn list(ctx: CommandContext, args: LsArgs) -> Result<()> {
    let layout = ImageLayout::open(&args.layout).await?;
    let rows: Vec<ManifestRow> = layout.manifests().await?.iter().map(Into::into).collect();

    print_output(&rows, ctx.format);
    Ok(())
}

/// Retag an image inside a layout.
async fn tag(ctx: CommandContext, args: TagArgs) -> Result<()> {
    let digest = Digest::parse(&args.digest)?;
    let layout = ImageLayout::open(&args.layout).await?;

    layout.tag_image(&digest, &args.tag).await?;
    let meta = layout.get_meta(&args.tag).await?;

    print_result(
        &format!("Tagged {} as {}", digest, meta.tag_reference),
        &meta,
        ctx.format,
    );
    Ok(())
}

/// Save credentials (and optionally the default source).
fn login(ctx: CommandContext, args: LoginArgs) -> Result<()> {
    let credentials = args
        .auth
        .credentials()?
        .ok_or(CliError::NoCredentials)?;
    credentials.save()?;

    if let Some(source) = args.source {
        let mut config = ctx.config;
        config.source = source;
        config.save()?;
    }

    print_success("Credentials saved");
    Ok(())
}

fn logout() -> Result<()> {
    Credentials::delete()?;
    print_success("Credentials removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use d8_mirror::oci::MEDIA_TYPE_OCI_MANIFEST;

    #[test]
    fn test_auth_args_license() {
        let args = AuthArgs {
            license: Some("token".to_string()),
            ..Default::default()
        };
        assert_eq!(
            args.credentials().unwrap().map(|c| c.auth()),
            Some(RegistryAuth::license("token"))
        );
    }

    #[test]
    fn test_auth_args_incomplete_login() {
        let args = AuthArgs {
            source_login: Some("user".to_string()),
            ..Default::default()
        };
        assert!(matches!(args.credentials(), Err(CliError::IncompleteLogin)));
        assert!(AuthArgs::default().credentials().unwrap().is_none());
    }

    #[test]
    fn test_manifest_row() {
        let mut desc = Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: Digest::sha256_of(b"manifest"),
            size: 512,
            annotations: None,
        };
        let bare = ManifestRow::from(&desc);
        assert_eq!(bare.short_tag, "-");

        desc.set_annotation(ANNOTATION_SHORT_TAG, "v1");
        desc.set_annotation(ANNOTATION_REF_NAME, "reg.io/repo:v1");
        let row = ManifestRow::from(&desc);
        assert_eq!(row.short_tag, "v1");
        assert_eq!(row.reference, "reg.io/repo:v1");
        assert_eq!(row.size, 512);
    }
}
