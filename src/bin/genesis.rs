//! Renders a genesis view for a new focal point.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;

use focalpoint::consideration::{now_unix, Consideration, PublicKey};
use focalpoint::constants::{INITIAL_TARGET, MAX_NUMBER};
use focalpoint::view::{View, ViewID};
use focalpoint::view_header_hasher::ViewHeaderHasher;

#[derive(Parser, Debug)]
#[command(name = "genesis", about = "Render a genesis view")]
struct Args {
    /// Memo to include in the genesis view's viewpoint
    #[arg(long)]
    memo: String,

    /// Base64-encoded public key credited by the genesis viewpoint
    #[arg(long)]
    pubkey: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.memo.is_empty() {
        return Err(anyhow!("memo required for the genesis view"));
    }

    let key_bytes = BASE64
        .decode(args.pubkey.trim())
        .context("decoding public key")?;
    if key_bytes.len() != 32 {
        return Err(anyhow!("public key is not 32 bytes"));
    }
    let mut pub_key = PublicKey::default();
    pub_key.0.copy_from_slice(&key_bytes);

    // the genesis viewpoint
    let viewpoint = Consideration::new(None, pub_key, 0, 0, 0, &args.memo);

    let target = ViewID::from_hex(INITIAL_TARGET).expect("initial target constant");
    let mut view = View::new(ViewID::default(), 0, target, ViewID::default(), vec![viewpoint])?;

    // keep hashing until the proof-of-work is satisfied
    let mut hasher = ViewHeaderHasher::new();
    let mut last_refresh = Instant::now();
    let id = loop {
        let (id, attempts) = hasher.update(&view.header);
        if id <= target {
            break id;
        }
        view.header.nonce += attempts;
        if view.header.nonce > MAX_NUMBER {
            view.header.nonce = 0;
        }
        if last_refresh.elapsed() >= Duration::from_secs(30) {
            view.header.time = now_unix();
            last_refresh = Instant::now();
        }
    };

    println!("{}", serde_json::to_string_pretty(&view)?);
    eprintln!("genesis view id: {}", id);
    Ok(())
}
