//! relay server configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default HTTP port (admin api + subdomain proxy)
    pub const DEFAULT_PORT: u16 = 4017;
    /// Default TLS front door port
    pub const DEFAULT_SNI_PORT: u16 = 443;
    /// Default ACME HTTP-01 challenge port
    pub const DEFAULT_ACME_PORT: u16 = 80;
    /// Default funnel domain; `localhost` selects the self-signed fallback
    pub static DEFAULT_FUNNEL_DOMAIN: &str = "localhost";
    /// Default ACME cache directory
    pub static DEFAULT_ACME_CACHE_DIR: &str = "./acme-cache";
    /// Default admin settings path
    pub static DEFAULT_SETTINGS_PATH: &str = "admin_settings.json";
    /// Lease TTL in seconds; backends renew at half this interval
    pub const DEFAULT_LEASE_TTL: u64 = 30;
    /// Default per-lease bytes/sec cap; 0 disables throttling
    pub const DEFAULT_LEASE_BPS: u64 = 0;
    /// Default per-lease concurrent connection cap; 0 means unlimited
    pub const DEFAULT_MAX_CONNECTIONS_PER_LEASE: u32 = 0;
    /// default log level. Can use this argument or PORTAL_LOG env var
    pub const DEFAULT_PORTAL_LOG: &str = "info";
    /// how long an inbound connection may wait for a reverse sub-stream
    pub const DEFAULT_ACQUIRE_TIMEOUT: u64 = 10;
    /// read deadline for the buffered TLS ClientHello
    pub const DEFAULT_HELLO_TIMEOUT: u64 = 5;

    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        path::PathBuf,
        time::Duration,
    };

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "portal", bin_name = "portal", about, long_about = None)]
    /// parses from cli & environment var. portal will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// HTTP port serving the registration api, admin api and subdomain proxy
        #[clap(long, env = "PORT", value_parser, default_value_t = DEFAULT_PORT)]
        pub port: u16,
        /// TCP port for the SNI-routed TLS front door
        #[clap(long, env = "SNI_PORT", value_parser, default_value_t = DEFAULT_SNI_PORT)]
        pub sni_port: u16,
        /// base URL advertised to backends; derived from the funnel domain when unset
        #[clap(long, env = "PORTAL_URL", value_parser)]
        pub portal_url: Option<String>,
        /// wildcard base domain under which every lease name becomes a subdomain
        #[clap(long, env = "FUNNEL_DOMAIN", value_parser, default_value = DEFAULT_FUNNEL_DOMAIN)]
        pub funnel_domain: String,
        /// cache directory for ACME material
        #[clap(long, env = "ACME_CACHE_DIR", value_parser, default_value = DEFAULT_ACME_CACHE_DIR)]
        pub acme_cache_dir: PathBuf,
        /// HTTP-01 challenge port
        #[clap(long, env = "ACME_PORT", value_parser, default_value_t = DEFAULT_ACME_PORT)]
        pub acme_port: u16,
        /// default bytes/sec cap applied to each direction of a bridged connection
        #[clap(long, env = "LEASE_BPS", value_parser, default_value_t = DEFAULT_LEASE_BPS)]
        pub lease_bps: u64,
        /// concurrent connection cap per lease; 0 means unlimited
        #[clap(long, env = "MAX_CONNECTIONS_PER_LEASE", value_parser, default_value_t = DEFAULT_MAX_CONNECTIONS_PER_LEASE)]
        pub max_connections_per_lease: u32,
        /// key protecting the admin api; random 16-byte hex when unset
        #[clap(long, env = "ADMIN_SECRET_KEY", value_parser)]
        pub admin_secret_key: Option<String>,
        /// serve X-Robots-Tag: noindex on proxied responses
        #[clap(long, env = "NOINDEX")]
        pub noindex: bool,
        /// path to the persisted admin settings
        #[clap(long, env = "SETTINGS_PATH", value_parser, default_value = DEFAULT_SETTINGS_PATH)]
        pub settings_path: PathBuf,
        /// lease TTL in seconds
        #[clap(long, env = "LEASE_TTL", value_parser, default_value_t = DEFAULT_LEASE_TTL)]
        pub lease_ttl: u64,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env = "PORTAL_LOG", value_parser, default_value = DEFAULT_PORTAL_LOG)]
        pub portal_log: String,
    }

    impl Config {
        /// Lease TTL as `Duration`
        pub fn lease_ttl(&self) -> Duration {
            Duration::from_secs(self.lease_ttl)
        }

        /// Sub-stream acquisition timeout
        pub fn acquire_timeout(&self) -> Duration {
            Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT)
        }

        /// ClientHello read deadline
        pub fn hello_timeout(&self) -> Duration {
            Duration::from_secs(DEFAULT_HELLO_TIMEOUT)
        }

        /// address of the HTTP listener
        pub fn http_addr(&self) -> SocketAddr {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
        }

        /// address of the SNI front door
        pub fn sni_addr(&self) -> SocketAddr {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.sni_port)
        }

        /// public URL a lease name is reachable at
        pub fn public_url(&self, name: &str) -> String {
            match &self.portal_url {
                Some(base) => {
                    let base = base.trim_end_matches('/');
                    match base.split_once("://") {
                        Some((scheme, rest)) => format!("{scheme}://{name}.{rest}"),
                        None => format!("https://{name}.{base}"),
                    }
                }
                None => format!("https://{name}.{}", self.funnel_domain),
            }
        }

        /// are we serving the real HTTPS port?
        pub fn is_default_sni_port(&self) -> bool {
            self.sni_port == DEFAULT_SNI_PORT
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use std::str;

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Make new trace config
        pub fn parse(portal_log: &str) -> Result<Self> {
            let log_frmt =
                std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            // Log level comes from PORTAL_LOG
            let filter = EnvFilter::try_new(portal_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
