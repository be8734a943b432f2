use clap::{Arg, Command};
use log::LevelFilter;
use pr_gatekeeper::admission::RegistrationKey;
use pr_gatekeeper::config::GatekeeperConfig;
use pr_gatekeeper::dkim::DkimPipeline;
use pr_gatekeeper::dkim_verification::HeaderDkimVerifier;
use pr_gatekeeper::dnswl::DnsWhitelist;
use pr_gatekeeper::error::GatekeeperError;
use pr_gatekeeper::lock::StoreLockManager;
use pr_gatekeeper::store::{MemoryStore, RecordStore};
use pr_gatekeeper::upload::RawEmailArchive;
use pr_gatekeeper::user_type::{DomainTrustClassifier, EmailClassifier};
use std::process;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("pr-gatekeeper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Registration gatekeeper: DKIM address proof, claim locks and abuse scoring")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(GatekeeperConfig::default_path()),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verify-email")
                .long("verify-email")
                .value_name("FILE")
                .help(
                    "Dry-run the DKIM registration pipeline on a raw email file. Advisory only: \
                     the verdict trusts the file's own Authentication-Results headers, which \
                     the sender controls",
                )
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("classify")
                .long("classify")
                .value_name("ADDRESS")
                .help("Show the organisation an email address or domain belongs to")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("public-key")
                .long("public-key")
                .help("Print the registration envelope public key (PEM)")
                .action(clap::ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        init_logging(matches.get_flag("verbose"), None);
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(GatekeeperConfig::default_path());
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    init_logging(
        matches.get_flag("verbose"),
        config.logging.as_ref().map(|l| l.level.as_str()),
    );

    if matches.get_flag("test-config") {
        println!("🔍 Testing configuration...");
        match config.validate() {
            Ok(()) => {
                println!("User types: {}", config.user_types.len());
                for user_type in &config.user_types {
                    println!(
                        "  {} (code {}): {} domains",
                        user_type.name,
                        user_type.code,
                        user_type.domains.len()
                    );
                }
                println!("Trusted signing domains: {}", config.helo_domains().len());
                if !config.registration.register_sk.is_empty() {
                    if let Err(e) = RegistrationKey::from_base64(&config.registration.register_sk) {
                        println!("❌ {e}");
                        process::exit(1);
                    }
                    println!("Registration key loaded");
                }
                println!("✅ Configuration is valid");
            }
            Err(e) => {
                println!("❌ Configuration validation failed: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("public-key") {
        match RegistrationKey::from_base64(&config.registration.register_sk)
            .and_then(|key| key.public_key_pem())
        {
            Ok(pem) => print!("{pem}"),
            Err(e) => {
                eprintln!("❌ {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Some(address) = matches.get_one::<String>("classify") {
        let classifier = build_classifier(&config);
        match classifier.classify_user_type(address) {
            Some(user_type) => println!("{address}: {} (code {})", user_type.name, user_type.code),
            None => {
                println!("{address}: not allowed to register");
                process::exit(2);
            }
        }
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("verify-email") {
        if let Err(e) = verify_email_file(&config, email_file).await {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
        return;
    }

    eprintln!("Nothing to do. The gatekeeper is a library; see --help for operator commands.");
    process::exit(2);
}

fn init_logging(verbose: bool, configured: Option<&str>) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        configured
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
}

fn load_config(path: &str) -> anyhow::Result<GatekeeperConfig> {
    if !std::path::Path::new(path).exists() && path == GatekeeperConfig::default_path() {
        eprintln!("Configuration file {path} not found, using defaults");
        return Ok(GatekeeperConfig::default());
    }
    GatekeeperConfig::from_file(path)
}

fn generate_default_config(path: &str) {
    let config = GatekeeperConfig::default();
    match config.to_file(path) {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn build_classifier(config: &GatekeeperConfig) -> DomainTrustClassifier {
    let classifier = DomainTrustClassifier::from_config(config);
    if !config.dnswl.enabled {
        return classifier;
    }
    match DnsWhitelist::from_system_conf(&config.dnswl) {
        Ok(dnswl) => classifier.with_allow_list(Arc::new(dnswl)),
        Err(e) => {
            log::warn!("DNS allow-list disabled, resolver unavailable: {e}");
            classifier
        }
    }
}

/// Dry run against an in-memory store. The archive goes to a scratch
/// directory so the configured one is never touched.
async fn verify_email_file(config: &GatekeeperConfig, path: &str) -> anyhow::Result<()> {
    let raw_email = tokio::fs::read(path).await?;
    let scratch = tempfile::tempdir()?;
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let pipeline = DkimPipeline::new(
        store.clone(),
        Arc::new(StoreLockManager::new(store)),
        Arc::new(build_classifier(config)),
        Arc::new(HeaderDkimVerifier::new()),
        RawEmailArchive::new(scratch.path()),
        config.site.relative_path.clone(),
    );

    println!("⚠️  Advisory: results are read from the file's Authentication-Results headers");
    match pipeline.verify(&raw_email).await {
        Ok(outcome) => {
            println!("✅ {}: {}", outcome.status, outcome.emailaddress);
            println!("UUID: {}", outcome.uuid);
            println!("Next: {}", outcome.next);
        }
        Err(GatekeeperError::Rejected { message, evidence }) => {
            println!("❌ {message}");
            println!("{}", serde_json::to_string_pretty(&evidence)?);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
