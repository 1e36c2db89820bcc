#![forbid(unsafe_code)]

mod api;
mod app;
mod apply;
mod atomic;
mod certs;
mod config;
mod db;
mod error;
mod fpm;
mod nginx;
mod provision;
mod render;
mod runner;
mod state;

use std::{path::Path, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context as _;
use clap::{ArgAction, Parser, Subcommand};
use time::macros::format_description;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::{
    app::{App, SiteAddRequest, SiteEditRequest},
    apply::{ApplyRequest, ApplyStatus},
    config::Config,
    db::{Db, SiteMode},
    runner::TokioCommandRunner,
    state::AppState,
};

#[derive(Parser, Debug)]
#[command(name = "ngm", version)]
#[command(about = "Control plane for a locally-installed nginx build")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(long, global = true, default_value = "/etc/ngm/config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API server
    Serve,
    /// Manage sites
    Site {
        #[command(subcommand)]
        cmd: SiteCmd,
    },
    /// Reconcile desired state onto nginx
    Apply {
        /// Apply only this domain
        #[arg(long)]
        domain: Option<String>,
        /// Apply all enabled sites, not only pending ones
        #[arg(long)]
        all: bool,
        /// Show what would be applied without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Max number of sites to apply (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Manage certificates
    Cert {
        #[command(subcommand)]
        cmd: CertCmd,
    },
    /// Manage proxy upstream targets
    Proxy {
        #[command(subcommand)]
        cmd: ProxyCmd,
    },
    /// Manage panel operator accounts
    PanelUser {
        #[command(subcommand)]
        cmd: PanelUserCmd,
    },
}

#[derive(Subcommand, Debug)]
enum SiteCmd {
    /// Create or update a site
    Add {
        /// Owner username
        #[arg(long)]
        user: String,
        /// Domain (e.g. example.com)
        #[arg(long)]
        domain: String,
        /// Mode: php|proxy|static
        #[arg(long, default_value = "php")]
        mode: String,
        /// PHP version key from config (defaults to phpfpm.default_version)
        #[arg(long, default_value = "")]
        php: String,
        /// Webroot path (default derived from user + domain)
        #[arg(long, default_value = "")]
        webroot: String,
        /// Enable HTTP/3
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        http3: bool,
        /// Create the linux user (if missing) and the site directories
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        provision: bool,
        /// Skip automatic certificate issuance
        #[arg(long)]
        skip_cert: bool,
        /// Publish the vhost immediately (needed for HTTP-01)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        apply_now: bool,
        /// Proxy target "addr" or "addr weight"; repeatable
        #[arg(long = "target")]
        targets: Vec<String>,
    },
    /// List sites with their reconciliation state
    List,
    /// Edit fields of an existing site
    Edit {
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = "")]
        user: String,
        /// Mode: php|proxy|static
        #[arg(long)]
        mode: Option<String>,
        #[arg(long, default_value = "")]
        php: String,
        #[arg(long, default_value = "")]
        webroot: String,
        /// true|false
        #[arg(long)]
        http3: Option<bool>,
        /// true|false
        #[arg(long)]
        enabled: Option<bool>,
        /// Apply immediately after the edit
        #[arg(long)]
        apply_now: bool,
    },
    /// Disable a site (soft delete); --purge permanently removes an
    /// already-disabled site and its children
    Rm {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        purge: bool,
    },
    /// Re-enable a disabled site
    Enable {
        #[arg(long)]
        domain: String,
    },
}

#[derive(Subcommand, Debug)]
enum CertCmd {
    /// List certificates in the live directory
    List,
    /// Show certificate details for one domain
    Info {
        #[arg(long)]
        domain: String,
    },
    /// Issue a certificate via the HTTP-01 webroot challenge
    Issue {
        #[arg(long)]
        domain: String,
        /// Do not apply the site after issuance
        #[arg(long)]
        no_apply: bool,
    },
    /// Renew one certificate, or all of them
    Renew {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        all: bool,
        /// Do not apply sites after renewal
        #[arg(long)]
        no_apply: bool,
    },
    /// List certificates expiring within N days
    Check {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCmd {
    /// Add or update an upstream target for a proxy site
    Add {
        #[arg(long)]
        domain: String,
        /// "host:port" or "unix:/path"
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 100)]
        weight: i64,
        /// Mark as a backup upstream
        #[arg(long)]
        backup: bool,
    },
    /// Disable an upstream target
    Rm {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        target: String,
    },
    /// List upstream targets for a site
    List {
        #[arg(long)]
        domain: String,
    },
}

#[derive(Subcommand, Debug)]
enum PanelUserCmd {
    /// Create or update a panel operator (hash the password externally)
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password_hash: String,
        #[arg(long, default_value = "admin")]
        role: String,
        #[arg(long)]
        disabled: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ngm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ngm: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Config::load(&cli.config)?;
    let db = Db::open(Path::new(&cfg.storage.sqlite_path)).await?;

    match cli.command {
        Commands::PanelUser { cmd } => panel_user_cmd(&db, cmd).await,
        command => {
            let app = App::new(cfg, db, Arc::new(TokioCommandRunner))?;
            match command {
                Commands::Serve => serve(app).await,
                Commands::Site { cmd } => site_cmd(&app, cmd).await,
                Commands::Apply {
                    domain,
                    all,
                    dry_run,
                    limit,
                } => {
                    apply_cmd(
                        &app,
                        ApplyRequest {
                            domain,
                            all,
                            dry_run,
                            limit,
                        },
                    )
                    .await
                }
                Commands::Cert { cmd } => cert_cmd(&app, cmd).await,
                Commands::Proxy { cmd } => proxy_cmd(&app, cmd).await,
                Commands::PanelUser { .. } => unreachable!("handled above"),
            }
        }
    }
}

async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    let listen = app.cfg.api.listen.clone();
    let router = api::router(AppState::new(app));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    tracing::info!(%listen, "ngm api listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn site_cmd(app: &App, cmd: SiteCmd) -> anyhow::Result<()> {
    match cmd {
        SiteCmd::Add {
            user,
            domain,
            mode,
            php,
            webroot,
            http3,
            provision,
            skip_cert,
            apply_now,
            targets,
        } => {
            let res = app
                .site_add(SiteAddRequest {
                    user,
                    domain,
                    mode: SiteMode::parse(&mode)?,
                    php_version: php,
                    webroot,
                    http3,
                    provision,
                    skip_cert,
                    apply_now,
                    proxy_targets: targets,
                })
                .await?;

            let s = &res.site;
            println!("OK: site saved");
            println!("  domain : {}", s.domain);
            println!("  user_id: {}", s.user_id);
            println!("  mode   : {}", s.mode);
            println!("  webroot: {}", s.webroot);
            println!("  php    : {}", s.php_version);
            println!("  http3  : {}", s.enable_http3);
            for w in &res.warnings {
                println!("WARNING: {w}");
            }
            Ok(())
        }
        SiteCmd::List => {
            let sites = app.site_list().await?;
            if sites.is_empty() {
                println!("(no sites)");
                return Ok(());
            }
            println!(
                "{:<25}  {:<6}  {:<5}  {:<8}  {:<9}  {:<17}  {:<40}  PHP",
                "DOMAIN", "MODE", "HTTP3", "ENABLED", "STATE", "LAST_APPLIED", "WEBROOT"
            );
            for s in sites {
                println!(
                    "{:<25}  {:<6}  {:<5}  {:<8}  {:<9}  {:<17}  {:<40}  {}",
                    s.domain,
                    s.mode.as_str(),
                    s.enable_http3,
                    if s.enabled { "yes" } else { "no" },
                    s.state(),
                    format_short_time(s.last_applied_at),
                    trim_len(&s.webroot, 40),
                    s.php_version,
                );
            }
            Ok(())
        }
        SiteCmd::Edit {
            domain,
            user,
            mode,
            php,
            webroot,
            http3,
            enabled,
            apply_now,
        } => {
            let mode = match mode {
                Some(m) => Some(SiteMode::parse(&m)?),
                None => None,
            };
            let s = app
                .site_edit(SiteEditRequest {
                    domain,
                    user,
                    mode,
                    php_version: php,
                    webroot,
                    http3,
                    enabled,
                    apply_now,
                })
                .await?;
            println!("OK: site updated");
            println!("  domain : {}", s.domain);
            println!("  mode   : {}", s.mode);
            println!("  webroot: {}", s.webroot);
            println!("  php    : {}", s.php_version);
            println!("  http3  : {}", s.enable_http3);
            println!("  enabled: {}", s.enabled);
            Ok(())
        }
        SiteCmd::Rm { domain, purge } => {
            if purge {
                app.site_delete(&domain).await?;
                println!("OK: site deleted permanently: {domain}");
            } else {
                app.site_disable(&domain).await?;
                println!("OK: site disabled (pending live removal): {domain}");
            }
            Ok(())
        }
        SiteCmd::Enable { domain } => {
            app.site_enable(&domain).await?;
            println!("OK: site enabled (pending apply): {domain}");
            Ok(())
        }
    }
}

async fn apply_cmd(app: &App, req: ApplyRequest) -> anyhow::Result<()> {
    let res = app.apply(req).await?;

    for r in &res.domains {
        let mut line = format!(
            "{:<25}  {:<7}  {:<8}  changed={}",
            r.domain,
            r.action.as_str(),
            r.status.as_str(),
            r.changed
        );
        if !r.error.is_empty() {
            line.push_str("  error=");
            line.push_str(&r.error);
        }
        println!("{line}");
    }
    println!(
        "summary: {} site(s), {} changed, reloaded={}",
        res.domains.len(),
        res.changed.len(),
        res.reloaded
    );

    let failed = res
        .domains
        .iter()
        .filter(|r| r.status == ApplyStatus::Fail)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} site(s) failed to apply");
    }
    Ok(())
}

async fn cert_cmd(app: &App, cmd: CertCmd) -> anyhow::Result<()> {
    match cmd {
        CertCmd::List => {
            let certs = app.cert_list()?;
            if certs.is_empty() {
                println!("(no certificates)");
                return Ok(());
            }
            println!("{:<30}  {:<10}  NOT_AFTER", "DOMAIN", "DAYS_LEFT");
            for c in certs {
                println!(
                    "{:<30}  {:<10}  {}",
                    c.domain,
                    c.days_left,
                    format_short_time(c.not_after)
                );
            }
            Ok(())
        }
        CertCmd::Info { domain } => {
            let info = app.cert_info(&domain)?;
            if !info.exists {
                println!("no certificate for {domain}");
                return Ok(());
            }
            println!("domain     : {}", info.domain);
            println!("cert       : {}", info.cert_path.display());
            println!("key        : {}", info.key_path.display());
            println!("not_before : {}", format_short_time(info.not_before));
            println!("not_after  : {}", format_short_time(info.not_after));
            println!("days_left  : {}", info.days_left);
            Ok(())
        }
        CertCmd::Issue { domain, no_apply } => {
            app.cert_issue(&domain, !no_apply).await?;
            println!("OK: certificate issued for {domain}");
            Ok(())
        }
        CertCmd::Renew {
            domain,
            all,
            no_apply,
        } => {
            app.cert_renew(&domain.unwrap_or_default(), all, !no_apply)
                .await?;
            println!("OK: renewal finished");
            Ok(())
        }
        CertCmd::Check { days } => {
            let expiring = app.cert_check(days)?;
            if expiring.is_empty() {
                println!("no certificates expire within {days} days");
                return Ok(());
            }
            for c in expiring {
                println!("{:<30}  {} day(s) left", c.domain, c.days_left);
            }
            Ok(())
        }
    }
}

async fn proxy_cmd(app: &App, cmd: ProxyCmd) -> anyhow::Result<()> {
    match cmd {
        ProxyCmd::Add {
            domain,
            target,
            weight,
            backup,
        } => {
            app.proxy_target_add(&domain, &target, weight, backup, true)
                .await?;
            println!("OK: target saved for {domain}: {target}");
            Ok(())
        }
        ProxyCmd::Rm { domain, target } => {
            app.proxy_target_disable(&domain, &target).await?;
            println!("OK: target disabled for {domain}: {target}");
            Ok(())
        }
        ProxyCmd::List { domain } => {
            let targets = app.proxy_target_list(&domain).await?;
            if targets.is_empty() {
                println!("(no targets)");
                return Ok(());
            }
            println!("{:<30}  {:<7}  {:<7}  ENABLED", "TARGET", "WEIGHT", "BACKUP");
            for t in targets {
                println!(
                    "{:<30}  {:<7}  {:<7}  {}",
                    t.target, t.weight, t.is_backup, t.enabled
                );
            }
            Ok(())
        }
    }
}

async fn panel_user_cmd(db: &Db, cmd: PanelUserCmd) -> anyhow::Result<()> {
    match cmd {
        PanelUserCmd::Add {
            username,
            password_hash,
            role,
            disabled,
        } => {
            let u = db
                .create_panel_user(&username, &password_hash, &role, !disabled)
                .await?;
            println!("OK: panel user saved: {} (role {})", u.username, u.role);
            Ok(())
        }
    }
}

fn format_short_time(t: Option<time::OffsetDateTime>) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    t.and_then(|t| t.format(&fmt).ok())
        .unwrap_or_else(|| "-".to_string())
}

fn trim_len(s: &str, max: usize) -> String {
    let len = s.chars().count();
    if len <= max {
        s.to_string()
    } else {
        let tail: String = s.chars().skip(len - (max - 1)).collect();
        format!("…{tail}")
    }
}
