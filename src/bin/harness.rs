/* fido-harness: a console test harness for exercising the library
 * against real hardware. Not part of the library's public API — this
 * binary uses `anyhow` for its own error flow and installs the tracing
 * subscriber the library only ever emits into. */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fido_hid::discovery;
use fido_hid::hid::device_io::enumerate_fido_devices;
use fido_hid::hid::Session;
use fido_hid::token::Token;
use fido_hid::types::{StartedAuthentication, StartedRegistration};

/// fido-harness — exercise a connected FIDO U2F authenticator.
#[derive(Parser)]
#[command(name = "fido-harness", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List currently-plugged FIDO authenticators.
    List,

    /// Flash the first authenticator's identification LED.
    Wink,

    /// Print the first authenticator's U2F version string.
    Version,

    /// Register a new credential against the first authenticator.
    Register {
        /// Relying party id.
        app_id: String,
        /// Server-issued challenge.
        challenge: String,
        /// Origin/facet presented to the device (omit for null).
        #[arg(long)]
        facet: Option<String>,
    },

    /// Sign a challenge with an existing credential.
    Authenticate {
        app_id: String,
        challenge: String,
        /// Base64-encoded key handle from a prior `register`.
        key_handle: String,
        #[arg(long)]
        facet: Option<String>,
        /// Skip requiring a touch before signing.
        #[arg(long)]
        no_user_presence: bool,
    },

    /// Check whether a key handle belongs to the first authenticator.
    CheckKeyHandle {
        app_id: String,
        challenge: String,
        key_handle: String,
    },

    /// Run `register` against every plugged authenticator in parallel,
    /// returning the first to succeed.
    ParallelRegister {
        app_id: String,
        challenge: String,
        #[arg(long)]
        facet: Option<String>,
    },
}

async fn open_first_device() -> Result<Session> {
    let cancel = CancellationToken::new();
    discovery::wait_for_device(&cancel)
        .await
        .context("no FIDO authenticator responded to INIT")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cmd_list().await,
        Commands::Wink => cmd_wink().await,
        Commands::Version => cmd_version().await,
        Commands::Register {
            app_id,
            challenge,
            facet,
        } => cmd_register(app_id, challenge, facet).await,
        Commands::Authenticate {
            app_id,
            challenge,
            key_handle,
            facet,
            no_user_presence,
        } => cmd_authenticate(app_id, challenge, key_handle, facet, !no_user_presence).await,
        Commands::CheckKeyHandle {
            app_id,
            challenge,
            key_handle,
        } => cmd_check_key_handle(app_id, challenge, key_handle).await,
        Commands::ParallelRegister {
            app_id,
            challenge,
            facet,
        } => cmd_parallel_register(app_id, challenge, facet).await,
    }
}

async fn cmd_list() -> Result<()> {
    let descriptors = enumerate_fido_devices().context("HID enumeration failed")?;
    if descriptors.is_empty() {
        println!("No FIDO authenticators found.");
        return Ok(());
    }
    for d in descriptors {
        let name = fido_hid::device_db::lookup(d.vendor_id, d.product_id)
            .or(d.product_string)
            .unwrap_or_else(|| "unknown device".to_string());
        println!("{:04x}:{:04x}  {}  ({})", d.vendor_id, d.product_id, name, d.path);
    }
    Ok(())
}

async fn cmd_wink() -> Result<()> {
    let session = open_first_device().await?;
    session.wink().await.context("wink failed")?;
    println!("Device identified itself.");
    Ok(())
}

async fn cmd_version() -> Result<()> {
    let session = open_first_device().await?;
    let token = Token::new(session);
    let version = token.get_version().await.context("GetVersion failed")?;
    println!("{version}");
    Ok(())
}

async fn cmd_register(app_id: String, challenge: String, facet: Option<String>) -> Result<()> {
    let session = open_first_device().await?;
    let token = Token::new(session);
    let request = StartedRegistration {
        app_id,
        challenge,
        version: fido_hid::constants::U2F_VERSION.to_string(),
    };
    let cancel = CancellationToken::new();
    println!("Touch your authenticator now...");
    let response = token
        .register(&request, facet.as_deref(), &cancel)
        .await
        .context("Register failed")?;
    println!("registrationData: {}", response.registration_data);
    println!("clientData:       {}", response.client_data);
    Ok(())
}

async fn cmd_authenticate(
    app_id: String,
    challenge: String,
    key_handle: String,
    facet: Option<String>,
    enforce_user_presence: bool,
) -> Result<()> {
    let session = open_first_device().await?;
    let token = Token::new(session);
    let request = StartedAuthentication {
        app_id,
        challenge,
        key_handle,
        version: fido_hid::constants::U2F_VERSION.to_string(),
    };
    let cancel = CancellationToken::new();
    if enforce_user_presence {
        println!("Touch your authenticator now...");
    }
    let response = token
        .authenticate(&request, enforce_user_presence, facet.as_deref(), &cancel)
        .await
        .context("Authenticate failed")?;
    println!("signatureData: {}", response.signature_data);
    println!("clientData:    {}", response.client_data);
    Ok(())
}

async fn cmd_check_key_handle(app_id: String, challenge: String, key_handle: String) -> Result<()> {
    let session = open_first_device().await?;
    let token = Token::new(session);
    let request = StartedAuthentication {
        app_id,
        challenge,
        key_handle,
        version: fido_hid::constants::U2F_VERSION.to_string(),
    };
    let valid = token
        .check_key_handle(&request)
        .await
        .context("CheckKeyHandle failed")?;
    println!("{valid}");
    Ok(())
}

async fn cmd_parallel_register(app_id: String, challenge: String, facet: Option<String>) -> Result<()> {
    let cancel = CancellationToken::new();
    let request = StartedRegistration {
        app_id,
        challenge,
        version: fido_hid::constants::U2F_VERSION.to_string(),
    };

    println!("Touch any plugged authenticator now...");
    let result = discovery::run_parallel(
        &cancel,
        move |session, task_cancel| {
            let request = request.clone();
            let facet = facet.clone();
            async move {
                let token = Token::new(session);
                token.register(&request, facet.as_deref(), &task_cancel).await
            }
        },
        |invalid_count| {
            if invalid_count > 0 {
                eprintln!("{invalid_count} device(s) rejected this credential so far");
            }
        },
    )
    .await
    .context("parallel register failed")?;

    match result {
        Some(response) => {
            println!("registrationData: {}", response.registration_data);
            println!("clientData:       {}", response.client_data);
        }
        None => println!("No authenticator responded."),
    }
    Ok(())
}
