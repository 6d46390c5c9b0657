use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};

use shmbox::{wait, ChannelConfig, ShmChannel, INFINITE};

const REQUEST_MAILBOX: usize = 0;
const RESPONSE_MAILBOX: usize = 1;
const POLL: Option<Duration> = Some(Duration::from_millis(100));
const END_MARKER: u64 = u64::MAX;

#[derive(clap::Parser)]
#[clap(about = "Consumes and verifies messages from a shared memory channel")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmbox-reader.toml")]
    config: String,
    /// Seconds to wait for the writer to create the channel.
    #[clap(long = "open-timeout", default_value_t = 30)]
    open_timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReaderConfig {
    channel: ChannelConfig,
    message_len: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            channel: ChannelConfig {
                name: "frame-channel".to_string(),
                owner: false,
                ..ChannelConfig::default()
            },
            message_len: 100,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    if cfg.message_len < 8 {
        return Err(format!("message_len must be at least 8, got {}", cfg.message_len).into());
    }

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let mut channel = cfg.channel.channel();
    let found = wait::poll_until(Duration::from_secs(opts.open_timeout), || {
        if stop.load(Ordering::Relaxed) {
            return Ok(true);
        }
        channel.open(cfg.channel.owner)
    })?;
    if !found || !channel.is_open() {
        return Err(format!("{} did not appear within {}s", cfg.channel.name, opts.open_timeout).into());
    }
    info!("reading from {:?}", channel);
    if let Err(e) = check_message_len(cfg.message_len, channel.size()?) {
        channel.close()?;
        return Err(e.into());
    }

    let outcome = run(&mut channel, &cfg, &stop);
    channel.close()?;
    outcome
}

fn check_message_len(message_len: usize, size: usize) -> Result<(), String> {
    if message_len > size {
        return Err(format!(
            "message_len {} does not fit in the {} byte segment",
            message_len, size
        ));
    }
    Ok(())
}

/// Sequence number of an intact message, `None` for a torn one.
fn verify(message: &[u8]) -> Option<u64> {
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&message[..8]);
    let seq = u64::from_le_bytes(seq);
    if seq == END_MARKER {
        return Some(seq);
    }
    let intact = message[8..]
        .iter()
        .enumerate()
        .all(|(i, &b)| b == (seq as usize).wrapping_add(i) as u8);
    if intact {
        Some(seq)
    } else {
        None
    }
}

fn run(channel: &mut ShmChannel, cfg: &ReaderConfig, stop: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let strategy = cfg.channel.wait_strategy;
    let duplex = channel.mailbox_count()? > RESPONSE_MAILBOX;
    let response_offset = channel.size()? / 2;
    let len = cfg.message_len;
    let start = Instant::now();
    let mut received = 0u64;

    loop {
        if !channel.wait_for_message(REQUEST_MAILBOX, POLL, strategy)? {
            if stop.load(Ordering::Relaxed) {
                warn!("interrupted after {} messages", received);
                break;
            }
            continue;
        }
        let seq = channel
            .access(INFINITE, |payload| verify(&payload[..len]))?
            .flatten();
        channel.unpost(REQUEST_MAILBOX)?;

        let seq = match seq {
            Some(END_MARKER) => {
                println!("\nFinished after {} messages", received);
                break;
            }
            Some(seq) if seq == received => seq,
            Some(seq) => return Err(format!("received {} while {} was expected", seq, received).into()),
            None => return Err(format!("message {} was torn", received).into()),
        };

        if duplex {
            while !channel.wait_for_empty(RESPONSE_MAILBOX, POLL, strategy)? {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }
            channel.access(INFINITE, |payload| {
                payload[response_offset..response_offset + 8].copy_from_slice(&seq.to_le_bytes())
            })?;
            channel.post(RESPONSE_MAILBOX)?;
        }

        received += 1;
        if received % 100_000 == 0 {
            eprint!("\rTotal {} ops (current value: {})", received, seq);
        }
    }

    let duration = start.elapsed();
    let iops = (received as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_len_must_fit_segment() {
        assert!(check_message_len(100, 4096).is_ok());
        assert!(check_message_len(4096, 4096).is_ok());
        assert!(check_message_len(4097, 4096).is_err());
        assert!(check_message_len(100, 64).is_err());
    }

    #[test]
    fn torn_messages_are_detected() {
        let mut message = vec![0u8; 16];
        message[..8].copy_from_slice(&7u64.to_le_bytes());
        for (i, b) in message[8..].iter_mut().enumerate() {
            *b = 7u8.wrapping_add(i as u8);
        }
        assert_eq!(verify(&message), Some(7));
        message[12] ^= 0xff;
        assert_eq!(verify(&message), None);
        assert_eq!(verify(&END_MARKER.to_le_bytes()), Some(END_MARKER));
    }
}
