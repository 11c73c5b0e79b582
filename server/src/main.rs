// scry CLI entry point

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::path::PathBuf;
use std::time::Duration;

const AUTH_SECRET_KEY_LENGTH: usize = 32;

#[derive(Parser)]
#[command(
    name = "scry",
    version,
    about = "Self-hosted metrics dashboard server"
)]
struct Cli {
    /// Path to the configuration document
    #[arg(short, long, default_value = "scry.yml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dashboard server (default)
    Serve,

    /// Check that the configuration document parses and validates
    #[command(name = "config:validate")]
    ConfigValidate,

    /// Print the expanded configuration document
    #[command(name = "config:print")]
    ConfigPrint {
        /// Print as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Generate a new auth secret key
    #[command(name = "secret:make")]
    SecretMake,

    /// Hash a password for the auth users table
    #[command(name = "password:hash")]
    PasswordHash { password: String },

    /// Print available hardware sensors
    #[command(name = "sensors:print")]
    SensorsPrint,

    /// Check the environment and upstream connectivity
    Diagnose,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli.config),
        Command::ConfigValidate => config_validate(&cli.config),
        Command::ConfigPrint { json } => config_print(&cli.config, json),
        Command::SecretMake => secret_make(),
        Command::PasswordHash { password } => password_hash(&password),
        Command::SensorsPrint => sensors_print(),
        Command::Diagnose => diagnose(&cli.config),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime construction cannot fail")
}

fn serve(config: &PathBuf) -> i32 {
    init_logging();
    match runtime().block_on(scry_core::app::run(config)) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn config_validate(config: &PathBuf) -> i32 {
    match scry_core::config::load(config) {
        Ok(_) => {
            println!("config is valid");
            0
        }
        Err(e) => {
            eprintln!("config is invalid: {e}");
            1
        }
    }
}

fn config_print(config: &PathBuf, json: bool) -> i32 {
    let loaded = match scry_core::config::load(config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("could not load config: {e}");
            return 1;
        }
    };

    if json {
        let value: serde_yaml::Value = match serde_yaml::from_str(&loaded.contents) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("could not re-parse config: {e}");
                return 1;
            }
        };
        match serde_json::to_string_pretty(&value) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("could not render config as JSON: {e}");
                return 1;
            }
        }
    } else {
        print!("{}", loaded.contents);
    }
    0
}

fn secret_make() -> i32 {
    let mut key = vec![0u8; AUTH_SECRET_KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    println!("{}", BASE64.encode(key));
    0
}

fn password_hash(password: &str) -> i32 {
    if password.len() < 6 {
        eprintln!("password must be at least 6 characters long");
        return 1;
    }
    match bcrypt::hash(password, bcrypt::DEFAULT_COST) {
        Ok(hash) => {
            println!("{hash}");
            0
        }
        Err(e) => {
            eprintln!("failed to hash password: {e}");
            1
        }
    }
}

fn sensors_print() -> i32 {
    let components = sysinfo::Components::new_with_refreshed_list();
    if components.is_empty() {
        println!("no sensors detected");
        return 0;
    }
    for component in &components {
        println!("{}: {:.1}°C", component.label(), component.temperature());
    }
    0
}

fn diagnose(config: &PathBuf) -> i32 {
    println!("scry diagnostics");
    println!("----------------");

    match std::env::var("MASTER_KEY") {
        Ok(key) if key.len() >= 32 => println!("MASTER_KEY: set"),
        Ok(key) => println!(
            "MASTER_KEY: set but short ({} chars, 32+ recommended)",
            key.len()
        ),
        Err(_) => println!("MASTER_KEY: not set (development key will be used)"),
    }
    match std::env::var("WEBHOOK_SECRET") {
        Ok(_) => println!("WEBHOOK_SECRET: set"),
        Err(_) => println!("WEBHOOK_SECRET: not set (webhook intake disabled)"),
    }

    match scry_core::config::load(config) {
        Ok(loaded) => println!(
            "config: ok ({} page(s), {} file(s))",
            loaded.document.pages.len(),
            loaded.watch_paths.len()
        ),
        Err(e) => println!("config: FAILED ({e})"),
    }

    let connectivity = runtime().block_on(async {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("scry-diagnose")
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err("could not build HTTP client".to_string()),
        };
        client
            .get("https://api.github.com/")
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|e| e.to_string())
    });
    match connectivity {
        Ok(status) => println!("outbound HTTPS: ok (status {status})"),
        Err(e) => println!("outbound HTTPS: FAILED ({e})"),
    }

    0
}
