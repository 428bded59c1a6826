//! Gyre Server, the headless CoinJoin round coordinator.
//!
//! # Usage
//!
//! ```bash
//! gyre-server --config /path/to/gyre.toml
//! gyre-server --config gyre.toml --validate
//! ```

mod config;
mod daemon;

use anyhow::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    // The process holds the coordinator seed; never let a crash write it
    // to disk.
    gyre_core::memory::disable_core_dumps();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/etc/gyre/gyre.toml");
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("gyre-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut server_config = config::ServerConfig::from_file(&config_path)?;
    server_config.apply_env_overrides();
    server_config.validate()?;

    std::env::set_var("RUST_LOG", &server_config.coordinator.log_level);
    env_logger::init();

    if validate_only {
        println!("Configuration is valid.");
        println!("  Name:      {}", server_config.coordinator.name);
        println!("  Network:   {}", server_config.coordinator.network);
        println!("  Listen:    {}", server_config.coordinator.listen);
        println!("  Bitcoind:  {}", server_config.bitcoind.rpc_url);
        println!("  Mix:       {} sat", server_config.round.amount);
        println!(
            "  Peers:     {}..{}",
            server_config.round.min_remix_peers + server_config.round.min_new_peers,
            server_config.round.max_peers
        );
        println!("  Tor key:   {}", server_config.tor_key_path().display());
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    if let Err(e) = rt.block_on(daemon::run(server_config)) {
        log::error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Gyre Server, a CoinJoin round coordinator

USAGE:
    gyre-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /etc/gyre/gyre.toml)
    --validate            Validate the config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    GYRE_NAME                    Coordinator name
    GYRE_NETWORK                 Bitcoin network (bitcoin/testnet/signet/regtest)
    GYRE_LISTEN                  TCP listen address
    GYRE_DATA_DIR                Data directory path
    GYRE_LOG_LEVEL               Log level (error/warn/info/debug/trace)
    GYRE_BITCOIND_RPC_URL        Bitcoin Core RPC url
    GYRE_BITCOIND_RPC_USER       Bitcoin Core RPC user
    GYRE_BITCOIND_RPC_PASSWORD   Bitcoin Core RPC password
    GYRE_MNEMONIC                Coordinator seed words (instead of the seed file)
"#
    );
}
