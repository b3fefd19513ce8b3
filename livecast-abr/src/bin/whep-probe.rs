//! Headless adaptive WHEP probe.
//!
//! Reads a simulcast publication through its WHEP endpoint and lets the
//! adaptive controller switch layers, logging every decision. Useful for
//! exercising a server's layer-pick policy from the command line.
//!
//! Usage: `whep-probe <whep-url> [cap-kbps ...]`
//!
//! Each extra argument adds one level with that bandwidth cap, ordered
//! high to low; with no caps the default four-level table is used.

use livecast_abr::{AbrConfig, AbrPlayer, Level};
use livecast_core::conf::LoggingConfig;
use livecast_core::logging::init_logging;

fn default_levels() -> Vec<Level> {
    vec![
        Level::new("high", 0),
        Level::new("medium", 1500),
        Level::new("low", 500),
        Level::audio("audio", 64),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::default())?;

    let mut args = std::env::args().skip(1);
    let endpoint: url::Url = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: whep-probe <whep-url> [cap-kbps ...]"))?
        .parse()?;

    let caps: Vec<u32> = args
        .map(|a| a.parse())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("invalid level cap: {e}"))?;
    let levels = if caps.is_empty() {
        default_levels()
    } else {
        caps.into_iter()
            .map(|cap| Level::new(&format!("{cap}kbps"), cap))
            .collect()
    };

    let mut player = AbrPlayer::new(endpoint, levels, 0, AbrConfig::default());

    let cancel = player.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    player.run().await?;
    Ok(())
}
