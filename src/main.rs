//! Eternal Packet CLI - Main Entry Point
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      etp CLI                                  │
//! │        ┌──────┐        ┌───────┐        ┌──────┐              │
//! │        │ cert │        │ serve │        │ send │              │
//! │        └──────┘        └───────┘        └──────┘              │
//! │                            │                │                 │
//! │  ┌──────────────────────────────────────────────────────────┐ │
//! │  │  Bootstrap: plaintext certificate, then TLS (rustls)      │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! │  ┌──────────────────────────────────────────────────────────┐ │
//! │  │  Packet: metadata + compressed payload, SHA-256 checked   │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use eternal_packet::client::format_size;
use eternal_packet::tls::{CERT_FILE_NAME, DEFAULT_ORGANIZATION, KEY_FILE_NAME};
use eternal_packet::{
    Client, ClientConfig, CompressionKind, CredentialParams, CredentialProvider,
    FileCredentialProvider, Server, ServerConfig, SessionBinding, TlsCredential,
};

/// Eternal Packet CLI
///
/// Sends one file per connection. The receiver hands out its certificate
/// in the clear and then only accepts a TLS connection from the same peer.
#[derive(Parser)]
#[command(name = "etp")]
#[command(version)]
#[command(about = "Bootstrap-secured, compressed, integrity-checked file transfer", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Receive files
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8443")]
        bind: SocketAddr,

        /// Directory holding server.crt and server.key
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Directory received files are written to
        #[arg(short, long, default_value = "./received")]
        output: PathBuf,

        /// How the TLS connection is matched to the certificate recipient
        #[arg(long, value_enum, default_value_t = BindingArg::Exact)]
        binding: BindingArg,

        /// RSA key size when a credential has to be generated
        #[arg(long, default_value_t = 4096)]
        bits: usize,

        /// Exit after the first transfer
        #[arg(long)]
        once: bool,
    },

    /// Send a file
    Send {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:8443")]
        server: SocketAddr,

        /// Server hostname for TLS verification
        #[arg(long, default_value = "localhost")]
        hostname: String,

        /// gzip, zlib or snappy; anything else uses snappy
        #[arg(short, long, default_value = "snappy")]
        compression: String,

        /// Local file to send
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate and key
    Generate {
        /// Output directory for server.crt and server.key
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Organization written into the subject
        #[arg(long, default_value = DEFAULT_ORGANIZATION)]
        org: String,

        /// Validity period in days
        #[arg(long, default_value_t = 365)]
        days: i64,

        /// RSA key size
        #[arg(long, default_value_t = 4096)]
        bits: usize,

        /// DNS names or IP addresses the certificate is valid for
        #[arg(long = "san", default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()])]
        sans: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BindingArg {
    /// Same IP address and port
    Exact,
    /// Same IP address only
    PeerIp,
}

impl From<BindingArg> for SessionBinding {
    fn from(arg: BindingArg) -> Self {
        match arg {
            BindingArg::Exact => SessionBinding::Exact,
            BindingArg::PeerIp => SessionBinding::PeerIp,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the crypto provider (required by rustls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install crypto provider"))?;

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action).await,
        Commands::Serve {
            bind,
            workdir,
            output,
            binding,
            bits,
            once,
        } => run_serve(bind, workdir, output, binding.into(), bits, once).await,
        Commands::Send {
            server,
            hostname,
            compression,
            file,
        } => run_send(server, hostname, &compression, file).await,
    }
}

async fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            org,
            days,
            bits,
            sans,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let params = CredentialParams {
                organization: org,
                validity_days: days,
                key_bits: bits,
                subject_alt_names: sans,
            };
            let credential =
                tokio::task::spawn_blocking(move || TlsCredential::generate(&params)).await??;

            std::fs::create_dir_all(&output)
                .with_context(|| format!("Failed to create {:?}", output))?;

            let cert_path = output.join(CERT_FILE_NAME);
            let key_path = output.join(KEY_FILE_NAME);
            credential.save(&cert_path, &key_path)?;

            info!("✅ Certificate generated successfully!");
            info!("   Certificate: {:?}", cert_path);
            info!("   Private key: {:?}", key_path);
            info!("");
            info!("📝 Usage:");
            info!("   Server: etp serve --workdir {:?}", output);

            Ok(())
        }
    }
}

async fn run_serve(
    bind: SocketAddr,
    workdir: PathBuf,
    output: PathBuf,
    binding: SessionBinding,
    bits: usize,
    once: bool,
) -> Result<()> {
    info!("🚀 Starting receiver...");

    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create working directory {:?}", workdir))?;

    let params = CredentialParams {
        key_bits: bits,
        ..CredentialParams::default()
    };
    let provider: Arc<dyn CredentialProvider> =
        Arc::new(FileCredentialProvider::in_dir(&workdir, params));

    let config = ServerConfig {
        bind_addr: bind,
        binding,
        show_progress: true,
        ..ServerConfig::default()
    };

    if once {
        let (metadata, path) = Server::receive_once(config, provider, &output)
            .await
            .context("Transfer failed")?;
        info!(
            "✅ Received {} ({}) -> {:?}",
            metadata.file_name,
            format_size(metadata.size),
            path
        );
        Ok(())
    } else {
        Server::serve(config, provider, &output).await?;
        Ok(())
    }
}

async fn run_send(
    server: SocketAddr,
    hostname: String,
    compression: &str,
    file: PathBuf,
) -> Result<()> {
    let kind = CompressionKind::from_tag(compression);

    let mut config = ClientConfig::new(server);
    config.server_name = hostname;
    config.show_progress = true;

    let session = Client::new(config)
        .connect()
        .await
        .with_context(|| format!("Failed to establish a session with {}", server))?;

    let metadata = session
        .send_file(&file, kind)
        .await
        .with_context(|| format!("Failed to send {:?}", file))?;

    info!(
        "✅ Sent {} ({} -> {} {})",
        metadata.file_name,
        format_size(metadata.size),
        format_size(metadata.compressed_size),
        metadata.compress_type
    );
    info!("   SHA-256: {}", metadata.file_hash);

    Ok(())
}
