use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{init_logging, unique_name};
use crate::{ElementType, ImageShape, IpcError, ShmChannel, StateError, INFINITE, SIMPLEX, TRY_LOCK};

/// Opens `name` on another thread, takes the lock, signals `locked` and
/// releases after `hold`.
fn hold_lock(name: &str, hold: Duration, locked: Arc<Barrier>) -> JoinHandle<Result<(), IpcError>> {
    let name = name.to_string();
    thread::spawn(move || {
        let mut channel = ShmChannel::new(&name);
        assert!(channel.open(false)?);
        assert!(channel.lock(INFINITE)?);
        locked.wait();
        thread::sleep(hold);
        channel.unlock()?;
        channel.close()
    })
}

fn create(prefix: &str) -> Result<(String, ShmChannel), IpcError> {
    let name = unique_name(prefix);
    let mut channel = ShmChannel::new(&name);
    channel.create(64, true, SIMPLEX)?;
    Ok((name, channel))
}

#[test]
fn test_try_lock_on_held_lock_fails_fast() -> Result<(), Box<dyn Error>> {
    init_logging();
    let (name, channel) = create("try_lock")?;
    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(300), Arc::clone(&locked));
    locked.wait();

    let started = Instant::now();
    assert!(!channel.lock(TRY_LOCK)?);
    assert!(!channel.try_lock()?);
    assert!(started.elapsed() < Duration::from_millis(200));

    holder.join().unwrap()?;
    assert!(channel.try_lock()?);
    channel.unlock()?;
    Ok(())
}

#[test]
fn test_infinite_lock_waits_for_release() -> Result<(), Box<dyn Error>> {
    let (name, channel) = create("infinite")?;
    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(150), Arc::clone(&locked));
    locked.wait();

    let started = Instant::now();
    assert!(channel.lock(INFINITE)?);
    assert!(started.elapsed() >= Duration::from_millis(100));
    channel.unlock()?;
    holder.join().unwrap()?;
    Ok(())
}

#[test]
fn test_bounded_lock_succeeds_when_released_in_time() -> Result<(), Box<dyn Error>> {
    let (name, channel) = create("bounded_ok")?;
    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(100), Arc::clone(&locked));
    locked.wait();

    assert!(channel.lock(1000)?);
    channel.unlock()?;
    holder.join().unwrap()?;
    Ok(())
}

#[test]
fn test_bounded_lock_times_out() -> Result<(), Box<dyn Error>> {
    let (name, channel) = create("bounded_timeout")?;
    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(1500), Arc::clone(&locked));
    locked.wait();

    let started = Instant::now();
    assert!(!channel.lock(300)?);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(250), "gave up after {:?}", waited);
    assert!(waited < Duration::from_millis(1400), "waited {:?}", waited);
    holder.join().unwrap()?;
    Ok(())
}

#[test]
fn test_unlock_without_lock() -> Result<(), Box<dyn Error>> {
    let (_name, channel) = create("not_locked")?;
    assert!(matches!(channel.unlock(), Err(IpcError::State(StateError::NotLocked))));
    assert!(channel.lock(TRY_LOCK)?);
    channel.unlock()?;
    assert!(channel.unlock().is_err());
    Ok(())
}

#[test]
fn test_lock_guard_releases() -> Result<(), Box<dyn Error>> {
    let (name, channel) = create("guard")?;
    {
        let guard = channel.lock_as_resource(INFINITE)?;
        assert!(guard.is_some());
    }
    let guard = channel.lock_as_resource(TRY_LOCK)?.expect("lock should be free again");
    guard.unlock()?;

    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(200), Arc::clone(&locked));
    locked.wait();
    assert!(channel.lock_as_resource(TRY_LOCK)?.is_none());
    holder.join().unwrap()?;
    Ok(())
}

#[test]
fn test_access_releases_on_panic() -> Result<(), Box<dyn Error>> {
    let (_name, mut channel) = create("access_panic")?;
    let written = channel.access(INFINITE, |payload| {
        payload[..2].copy_from_slice(&[7, 8]);
        payload.len()
    })?;
    assert_eq!(written, Some(64));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = channel.access(INFINITE, |_: &mut [u8]| -> u8 { panic!("reader blew up") });
    }));
    assert!(outcome.is_err());

    assert_eq!(channel.try_access(|payload| payload[1])?, Some(8));
    Ok(())
}

#[test]
fn test_access_reports_busy_lock() -> Result<(), Box<dyn Error>> {
    let (name, mut channel) = create("access_busy")?;
    let locked = Arc::new(Barrier::new(2));
    let holder = hold_lock(&name, Duration::from_millis(200), Arc::clone(&locked));
    locked.wait();

    assert_eq!(channel.try_access(|_| ())?, None);
    assert!(channel.try_access_as_image(0, &ImageShape::matrix(8, 8), ElementType::U8C1)?.is_none());
    holder.join().unwrap()?;

    let view = channel.try_access_as_image(0, &ImageShape::matrix(8, 8), ElementType::U8C1)?;
    assert!(view.is_some());
    drop(view);
    assert!(channel.try_lock()?);
    channel.unlock()?;
    Ok(())
}
