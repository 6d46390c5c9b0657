use std::env;
use std::error::Error;
use std::process::{self, Command};
use std::time::Duration;

use shmbox::{wait, ShmChannel, WaitStrategy, INFINITE, SIMPLEX};

const SEGMENT_SIZE: usize = 4096;
const MESSAGE_LEN: usize = 100;
const MESSAGES: usize = 1_000;
const PATIENCE: Option<Duration> = Some(Duration::from_secs(10));

fn pattern(seq: usize) -> Vec<u8> {
    (0..MESSAGE_LEN).map(|i| (i * 7 + seq) as u8).collect()
}

fn fail(msg: String) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("consumer") => {
            let name = args.get(2).ok_or_else(|| fail("consumer needs a segment name".to_string()))?;
            consumer(name)
        }
        _ => producer(),
    }
}

fn producer() -> Result<(), Box<dyn Error>> {
    let name = format!("frame-channel-{}", process::id());
    println!("[Producer] Creating {} ({} bytes)", name, SEGMENT_SIZE);

    let mut channel = ShmChannel::new(&name);
    channel.create(SEGMENT_SIZE, true, SIMPLEX)?;

    let mut child = Command::new(env::current_exe()?)
        .arg("consumer")
        .arg(&name)
        .spawn()?;

    for seq in 0..MESSAGES {
        if !channel.wait_for_empty(0, PATIENCE, WaitStrategy::Backoff)? {
            let _ = child.kill();
            return Err(fail(format!("consumer stopped draining at message {}", seq)));
        }
        let message = pattern(seq);
        channel.access(INFINITE, |payload| payload[..MESSAGE_LEN].copy_from_slice(&message))?;
        channel.post(0)?;
    }
    println!("[Producer] Sent {} messages", MESSAGES);

    let status = child.wait()?;
    if !status.success() {
        return Err(fail(format!("consumer exited with {}", status)));
    }

    // The consumer was not the owner, so the segment is still there.
    let mut probe = ShmChannel::new(&name);
    if !probe.open(false)? {
        return Err(fail(format!("{} vanished when the consumer closed", name)));
    }
    probe.close()?;

    channel.close()?;
    if ShmChannel::new(&name).open(false)? {
        return Err(fail(format!("{} survived its owner", name)));
    }
    println!("\nSimulation successful! All messages sent and received correctly.");
    Ok(())
}

fn consumer(name: &str) -> Result<(), Box<dyn Error>> {
    let mut channel = ShmChannel::new(name);
    if !wait::poll_until(Duration::from_secs(10), || channel.open(false))? {
        return Err(fail(format!("[Consumer] {} never appeared", name)));
    }

    for seq in 0..MESSAGES {
        if !channel.wait_for_message(0, PATIENCE, WaitStrategy::Backoff)? {
            return Err(fail(format!("[Consumer] message {} never arrived", seq)));
        }
        let message = channel
            .access(INFINITE, |payload| payload[..MESSAGE_LEN].to_vec())?
            .ok_or_else(|| fail("lock was not obtained".to_string()))?;
        channel.unpost(0)?;
        if message != pattern(seq) {
            return Err(fail(format!("[Consumer] message {} does not match", seq)));
        }
    }
    println!("[Consumer] Received {} messages", MESSAGES);
    channel.close()?;
    Ok(())
}
