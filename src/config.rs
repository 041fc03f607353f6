use crate::services::bootstrap::{self, AdminSeed, Seed};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, ops::RangeInclusive, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// FTP listener address; FTP is disabled when unset.
    pub ftp_addr: Option<String>,
    pub ftp_passive_ports: RangeInclusive<u16>,
    /// SFTP listener address; SFTP is disabled when unset.
    pub sftp_addr: Option<String>,
    /// OpenSSH private key; an ephemeral key is generated when unset.
    pub sftp_host_key: Option<String>,
    pub webdav: bool,
    pub usage_ttl: Duration,
    pub ticket_ttl: Duration,
    /// Admin account and spaces provisioned at startup.
    pub seed: Seed,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-protocol space storage engine")]
pub struct Args {
    /// Host to bind to (overrides SPACEFS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port (overrides SPACEFS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides SPACEFS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// FTP listen address, e.g. 0.0.0.0:2121 (overrides SPACEFS_FTP_ADDR)
    #[arg(long)]
    pub ftp_addr: Option<String>,

    /// FTP passive port range `low-high` (overrides SPACEFS_FTP_PASSIVE_PORTS)
    #[arg(long)]
    pub ftp_passive_ports: Option<String>,

    /// SFTP listen address, e.g. 0.0.0.0:2222 (overrides SPACEFS_SFTP_ADDR)
    #[arg(long)]
    pub sftp_addr: Option<String>,

    /// SSH host key file (overrides SPACEFS_SFTP_HOST_KEY)
    #[arg(long)]
    pub sftp_host_key: Option<String>,

    /// Admin account created at startup; the password is read from
    /// SPACEFS_ADMIN_PASSWORD (overrides SPACEFS_ADMIN_USER)
    #[arg(long)]
    pub admin_user: Option<String>,

    /// Space to register at startup as `name=path`, repeatable (overrides SPACEFS_SPACES)
    #[arg(long = "space", value_name = "NAME=PATH")]
    pub spaces: Vec<String>,

    /// Disable the WebDAV mount (overrides SPACEFS_WEBDAV)
    #[arg(long)]
    pub no_webdav: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |key| env::var(key).ok())?, migrate))
    }

    /// Merge CLI args over values looked up with `var`.
    fn merge(args: Args, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_port = parse_var(&var, "SPACEFS_PORT")?.unwrap_or(8080);
        let env_webdav = parse_var::<bool>(&var, "SPACEFS_WEBDAV")?.unwrap_or(true);
        let usage_ttl = parse_var(&var, "SPACEFS_USAGE_TTL_SECS")?.unwrap_or(10);
        let ticket_ttl = parse_var(&var, "SPACEFS_TICKET_TTL_SECS")?.unwrap_or(300);

        let passive = args
            .ftp_passive_ports
            .or_else(|| var("SPACEFS_FTP_PASSIVE_PORTS"))
            .unwrap_or_else(|| "50000-50100".into());

        let admin_user = args.admin_user.or_else(|| var("SPACEFS_ADMIN_USER"));
        let admin = match (var("SPACEFS_ADMIN_PASSWORD"), admin_user) {
            (Some(password), user) => Some(AdminSeed {
                username: user.unwrap_or_else(|| "admin".into()),
                password,
            }),
            (None, Some(user)) => bail!("SPACEFS_ADMIN_PASSWORD is required for admin `{}`", user),
            (None, None) => None,
        };
        let spaces = if args.spaces.is_empty() {
            let value = var("SPACEFS_SPACES").unwrap_or_default();
            bootstrap::parse_spaces(&value)
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("parsing SPACEFS_SPACES value `{}`", value))?
        } else {
            bootstrap::parse_spaces(&args.spaces.join(","))
                .map_err(|e| anyhow!(e))
                .context("parsing --space")?
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| var("SPACEFS_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            database_url: args
                .database_url
                .or_else(|| var("SPACEFS_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/spacefs.db".into()),
            ftp_addr: args.ftp_addr.or_else(|| var("SPACEFS_FTP_ADDR")),
            ftp_passive_ports: parse_port_range(&passive)
                .with_context(|| format!("parsing SPACEFS_FTP_PASSIVE_PORTS value `{}`", passive))?,
            sftp_addr: args.sftp_addr.or_else(|| var("SPACEFS_SFTP_ADDR")),
            sftp_host_key: args.sftp_host_key.or_else(|| var("SPACEFS_SFTP_HOST_KEY")),
            webdav: env_webdav && !args.no_webdav,
            usage_ttl: Duration::from_secs(usage_ttl),
            ticket_ttl: Duration::from_secs(ticket_ttl),
            seed: Seed { admin, spaces },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>> {
    let Some((low, high)) = value.split_once('-') else {
        bail!("expected `low-high`");
    };
    let (low, high) = (low.trim().parse::<u16>()?, high.trim().parse::<u16>()?);
    if low > high {
        bail!("range start {} is above its end {}", low, high);
    }
    Ok(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn merge(args: Args, vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::merge(args, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = merge(Args::default(), &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.ftp_passive_ports, 50000..=50100);
        assert!(cfg.webdav);
        assert!(cfg.ftp_addr.is_none());
        assert_eq!(cfg.usage_ttl, Duration::from_secs(10));
    }

    #[test]
    fn args_override_environment() {
        let args = Args {
            port: Some(9000),
            no_webdav: true,
            ..Default::default()
        };
        let cfg = merge(
            args,
            &[("SPACEFS_PORT", "7000"), ("SPACEFS_FTP_ADDR", "127.0.0.1:2121")],
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(!cfg.webdav);
        assert_eq!(cfg.ftp_addr.as_deref(), Some("127.0.0.1:2121"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = merge(Args::default(), &[("SPACEFS_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("SPACEFS_PORT"));
        assert!(merge(Args::default(), &[("SPACEFS_FTP_PASSIVE_PORTS", "9-1")]).is_err());
        assert!(merge(Args::default(), &[("SPACEFS_SPACES", "docs")]).is_err());
    }

    #[test]
    fn seed_comes_from_environment_and_flags() {
        let cfg = merge(Args::default(), &[]).unwrap();
        assert!(cfg.seed.admin.is_none());
        assert!(cfg.seed.spaces.is_empty());

        let cfg = merge(
            Args::default(),
            &[
                ("SPACEFS_ADMIN_PASSWORD", "s3cret"),
                ("SPACEFS_SPACES", "docs=/srv/docs,media=/srv/media"),
            ],
        )
        .unwrap();
        let admin = cfg.seed.admin.as_ref().unwrap();
        assert_eq!(admin.username, "admin");
        assert_eq!(admin.password, "s3cret");
        assert_eq!(cfg.seed.spaces.len(), 2);
        assert!(!format!("{:?}", cfg).contains("s3cret"));

        let args = Args {
            admin_user: Some("root".into()),
            spaces: vec!["team=/srv/team".into()],
            ..Default::default()
        };
        let cfg = merge(
            args,
            &[
                ("SPACEFS_ADMIN_PASSWORD", "pw"),
                ("SPACEFS_SPACES", "docs=/srv/docs"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.seed.admin.unwrap().username, "root");
        assert_eq!(cfg.seed.spaces[0].name, "team");
        assert_eq!(cfg.seed.spaces.len(), 1);
    }

    #[test]
    fn admin_without_password_is_rejected() {
        let err = merge(Args::default(), &[("SPACEFS_ADMIN_USER", "root")]).unwrap_err();
        assert!(err.to_string().contains("SPACEFS_ADMIN_PASSWORD"));
    }
}
