use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nbdstack::filters::{DelayFilter, LogFilter, NoParallelFilter, RetryFilter};
use nbdstack::{
    Config, Filter, Listen, Registry, Server, Settings, Stack, ThreadModel, TlsMode,
};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// TCP address to listen on
    #[clap(long, default_value = "127.0.0.1:10809")]
    addr: String,

    /// Listen on a unix socket instead of TCP
    #[clap(long)]
    unix: Option<PathBuf>,

    /// Use the legacy oldstyle handshake
    #[clap(long)]
    oldstyle: bool,

    /// Refuse writes on every connection
    #[clap(long)]
    readonly: bool,

    /// Serve from memory instead of a file
    #[clap(long)]
    mem: bool,

    /// Serve synthetic zeroes and discard writes
    #[clap(long)]
    null: bool,

    /// Do not create or resize the backing file
    #[clap(long)]
    no_create: bool,

    #[clap(long, default_value = "default")]
    export: String,

    /// Disk size in MiB (memory/null plugins, or when creating the file)
    #[clap(short, long, default_value_t = 10)]
    size: usize,

    /// Log every storage operation
    #[clap(long)]
    log_requests: bool,

    /// Delay reads by this many milliseconds
    #[clap(long, default_value_t = 0)]
    delay_read: u64,

    /// Delay writes by this many milliseconds
    #[clap(long, default_value_t = 0)]
    delay_write: u64,

    /// Serialize more than the plugin asks for: requests, all-requests, or
    /// connections
    #[clap(long)]
    serialize: Option<String>,

    /// Retry failed operations this many times after reopening the plugin
    #[clap(long, default_value_t = 0)]
    retries: u32,

    /// Worker threads per connection under the parallel model
    #[clap(long)]
    threads: Option<usize>,

    /// TLS policy: off, on, or require
    #[clap(long, default_value = "off")]
    tls: String,

    /// Server certificate chain (PEM)
    #[clap(long)]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[clap(long)]
    tls_key: Option<PathBuf>,

    #[clap(default_value = "disk.img")]
    filename: String,
}

fn load_tls(cert: &PathBuf, key: &PathBuf) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert).wrap_err("opening TLS certificate")?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .wrap_err("parsing TLS certificate")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key).wrap_err("opening TLS key")?,
    ))
    .wrap_err("parsing TLS key")?
    .ok_or_else(|| color_eyre::eyre::eyre!("no private key found"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .wrap_err("building TLS configuration")?;
    Ok(Arc::new(config))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let size_bytes = args.size as u64 * 1024 * 1024;

    let mut settings = Settings::new();
    settings
        .set("export", args.export.clone())
        .set("size", format!("{}M", args.size));
    let plugin_name = if args.mem {
        "memory"
    } else if args.null {
        "null"
    } else {
        if !args.no_create {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&args.filename)
                .wrap_err_with(|| format!("creating {}", args.filename))?;
            file.set_len(size_bytes)?;
        }
        settings.set("path", args.filename.clone());
        "file"
    };
    let plugin = Registry::builtin().resolve(plugin_name, &settings)?;

    // outermost first: logging sees requests before any other filter
    let mut filters: Vec<Box<dyn Filter>> = vec![];
    if args.log_requests {
        filters.push(Box::new(LogFilter::new()));
    }
    if args.delay_read > 0 || args.delay_write > 0 {
        filters.push(Box::new(
            DelayFilter::new()
                .read(Duration::from_millis(args.delay_read))
                .write(Duration::from_millis(args.delay_write)),
        ));
    }
    if let Some(mode) = &args.serialize {
        let model = match mode.as_str() {
            "requests" => ThreadModel::SerializeRequests,
            "all-requests" => ThreadModel::SerializeAllRequests,
            "connections" => ThreadModel::SerializeConnections,
            other => bail!("unknown serialize mode {other:?}"),
        };
        filters.push(Box::new(NoParallelFilter::new(model)));
    }
    if args.retries > 0 {
        filters.push(Box::new(RetryFilter::new(
            args.retries,
            Duration::from_secs(2),
            true,
        )));
    }

    let tls_mode = match args.tls.as_str() {
        "off" => TlsMode::Disabled,
        "on" => TlsMode::Allowed,
        "require" => TlsMode::Required,
        other => bail!("unknown TLS mode {other:?}"),
    };
    let tls_config = match (tls_mode, &args.tls_cert, &args.tls_key) {
        (TlsMode::Disabled, _, _) => None,
        (_, Some(cert), Some(key)) => Some(load_tls(cert, key)?),
        _ => bail!("--tls requires --tls-cert and --tls-key"),
    };

    let cfg = Config {
        listen: match args.unix {
            Some(path) => Listen::Unix(path),
            None => Listen::Tcp(args.addr),
        },
        oldstyle: args.oldstyle,
        readonly: args.readonly,
        tls_mode,
        tls_config,
        workers: args.threads,
    };

    Server::new(Stack::new(filters, plugin), cfg).start()?;
    Ok(())
}
