use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::passphrase::DEFAULT_PASSPHRASE_WORDS;

const MAX_PASSPHRASE_WORDS: usize = 16;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub wordlist: PathBuf,
    pub passphrase_words: usize,
    /// `None` keeps unanswered offers until their offerer disconnects.
    pub offer_ttl: Option<Duration>,
    pub reap_interval: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "flare-server",
    author,
    version,
    about = "Pairs WebRTC peers through a diceware passphrase and relays their signaling"
)]
pub struct Cli {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "FLARE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Diceware word list (EFF `11111<TAB>word` format or one word per line).
    #[arg(long, env = "FLARE_WORDLIST", default_value = "eff_large_wordlist.txt")]
    pub wordlist: PathBuf,

    /// Number of words in each generated passphrase.
    #[arg(long, env = "FLARE_PASSPHRASE_WORDS", default_value_t = DEFAULT_PASSPHRASE_WORDS)]
    pub passphrase_words: usize,

    /// Expire offers nobody requested after this many seconds. Unset keeps
    /// them until the offerer disconnects.
    #[arg(long, env = "FLARE_OFFER_TTL_SECS")]
    pub offer_ttl_secs: Option<u64>,

    /// How often expired offers are swept when a TTL is set.
    #[arg(long, env = "FLARE_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Pause after the listener stops before the process exits.
    #[arg(long, env = "FLARE_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.passphrase_words == 0 || cli.passphrase_words > MAX_PASSPHRASE_WORDS {
            bail!(
                "passphrase word count must be between 1 and {MAX_PASSPHRASE_WORDS}, got {}",
                cli.passphrase_words
            );
        }
        if cli.reap_interval_secs == 0 {
            bail!("reap interval must be greater than zero");
        }
        let offer_ttl = match cli.offer_ttl_secs {
            Some(0) => bail!("offer TTL must be greater than zero"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ServerConfig {
            listen_addr,
            wordlist: cli.wordlist,
            passphrase_words: cli.passphrase_words,
            offer_ttl,
            reap_interval: Duration::from_secs(cli.reap_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
