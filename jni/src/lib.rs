//! Native half of `io.shmbox.ShmChannel`.
//!
//! Every channel handle must only be used from the Java thread that created
//! it. Calls report failures as status codes (see `errString`), except
//! where a value is returned, which throw `io.shmbox.IpcException`.

use std::ptr;

use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jint, jlong, jobject, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, error, LevelFilter};
use serde::{Deserialize, Serialize};

use shmbox::runtime;
use shmbox::{Backend, ChannelConfig, ErrorCode, IpcError, SegmentId, ShmChannel, StateError, Status};

mod handle;

use handle::{borrow_handle, into_handle, release_handle};

const EXCEPTION_CLASS: &str = "io/shmbox/IpcException";

/// Layout of the file given to `newHandleFromConfig`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JniConfig {
    log_level: Option<i32>,
    channel: ChannelConfig,
}

fn status_of(result: Result<(), IpcError>) -> jlong {
    match result {
        Ok(()) => Status::OK.raw() as jlong,
        Err(e) => {
            debug!("native call failed: {}", e);
            e.status().raw() as jlong
        }
    }
}

fn throw(env: &mut JNIEnv, err: &IpcError) {
    let message = format!("{} ({})", err, err.status());
    if let Err(e) = env.throw_new(EXCEPTION_CLASS, message) {
        error!("could not raise {}: {}: {}", EXCEPTION_CLASS, e, err);
    }
}

fn to_bool(value: jboolean) -> bool {
    value != JNI_FALSE
}

fn from_bool(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

fn java_string(env: &mut JNIEnv, value: &JString) -> Result<String, IpcError> {
    env.get_string(value).map(String::from).map_err(|e| IpcError::Native {
        status: Status::from_code(ErrorCode::NullRef),
        message: format!("could not read java string: {}", e),
    })
}

fn backend_of(ordinal: jint) -> Result<Backend, IpcError> {
    Backend::from_ordinal(ordinal).ok_or(IpcError::State(StateError::InvalidState))
}

fn non_negative(value: jlong) -> Result<usize, IpcError> {
    if value < 0 {
        return Err(IpcError::Bounds {
            offset: 0,
            length: 0,
            size: 0,
        });
    }
    Ok(value as usize)
}

fn with_channel<F>(handle: jlong, f: F) -> jlong
where
    F: FnOnce(&mut ShmChannel) -> Result<(), IpcError>,
{
    status_of(unsafe { borrow_handle::<ShmChannel>(handle) }.and_then(f))
}

fn init_logging(level: LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
    runtime::initialize(level);
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_initialize(
    _env: JNIEnv, _class: JClass, native_level: jint,
) -> jboolean {
    let level = runtime::level_from_native(native_level);
    let first = !runtime::is_initialized();
    init_logging(level);
    from_bool(first)
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_shutdown(_env: JNIEnv, _class: JClass) -> jboolean {
    from_bool(runtime::shutdown())
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_statusOk(_env: JNIEnv, _class: JClass) -> jlong {
    Status::OK.raw() as jlong
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_statusWouldBlock(_env: JNIEnv, _class: JClass) -> jlong {
    Status::WOULD_BLOCK.raw() as jlong
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_errString<'local>(
    env: JNIEnv<'local>, _class: JClass<'local>, status: jlong,
) -> jstring {
    let message = Status::from_raw(status as u64).message();
    match env.new_string(message) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("could not allocate error string: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_newHandle(
    mut env: JNIEnv, _class: JClass, j_name: JString, backend: jint,
) -> jlong {
    let channel = java_string(&mut env, &j_name)
        .and_then(|name| Ok(ShmChannel::with_id(SegmentId::new(&name), backend_of(backend)?)));
    match channel {
        Ok(channel) => into_handle(channel),
        Err(e) => {
            throw(&mut env, &e);
            0
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_newHandleWithKey(
    mut env: JNIEnv, _class: JClass, j_name: JString, key: jint, backend: jint,
) -> jlong {
    let channel = java_string(&mut env, &j_name)
        .and_then(|name| Ok(ShmChannel::with_id(SegmentId::with_key(&name, key), backend_of(backend)?)));
    match channel {
        Ok(channel) => into_handle(channel),
        Err(e) => {
            throw(&mut env, &e);
            0
        }
    }
}

/// Reads a TOML file with an optional `log_level` and a `[channel]` table.
/// A missing file is written with defaults first.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_newHandleFromConfig(
    mut env: JNIEnv, _class: JClass, j_config_path: JString,
) -> jlong {
    let config = java_string(&mut env, &j_config_path).and_then(|path| {
        confy::load_path::<JniConfig>(&path).map_err(|e| IpcError::Native {
            status: Status::from_code(ErrorCode::InvalidState),
            message: format!("failed to load {}: {}", path, e),
        })
    });
    match config {
        Ok(config) => {
            if let Some(level) = config.log_level {
                init_logging(runtime::level_from_native(level));
            }
            into_handle(config.channel.channel())
        }
        Err(e) => {
            throw(&mut env, &e);
            0
        }
    }
}

/// Same as `newHandleFromConfig` for TOML held in memory.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_newHandleFromToml(
    mut env: JNIEnv, _class: JClass, j_toml: JString,
) -> jlong {
    let config = java_string(&mut env, &j_toml).and_then(|text| {
        toml::from_str::<JniConfig>(&text).map_err(|e| IpcError::Native {
            status: Status::from_code(ErrorCode::InvalidState),
            message: format!("invalid channel config: {}", e),
        })
    });
    match config {
        Ok(config) => into_handle(config.channel.channel()),
        Err(e) => {
            throw(&mut env, &e);
            0
        }
    }
}

/// Closes the channel if still open and frees the handle.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_destroyHandle(
    _env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    match unsafe { release_handle::<ShmChannel>(handle) } {
        Some(channel) => {
            drop(channel);
            Status::OK.raw() as jlong
        }
        None => IpcError::from(StateError::NullHandle).status().raw() as jlong,
    }
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_create(
    _env: JNIEnv, _class: JClass, handle: jlong, size: jlong, owner: jboolean, mailboxes: jint,
) -> jlong {
    with_channel(handle, |channel| {
        channel.create(non_negative(size)?, to_bool(owner), non_negative(mailboxes as jlong)?)
    })
}

/// `OK` when attached, the would-block status while the segment is missing.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_open(
    _env: JNIEnv, _class: JClass, handle: jlong, owner: jboolean,
) -> jlong {
    with_channel(handle, |channel| {
        if channel.open(to_bool(owner))? {
            Ok(())
        } else {
            Err(IpcError::WouldBlock)
        }
    })
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_unlink(
    _env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    with_channel(handle, |channel| channel.unlink())
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_close(
    _env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    with_channel(handle, |channel| channel.close())
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_reset(
    _env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    with_channel(handle, |channel| channel.reset())
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_post(
    _env: JNIEnv, _class: JClass, handle: jlong, mailbox: jint,
) -> jlong {
    with_channel(handle, |channel| channel.post(non_negative(mailbox as jlong)?))
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_unpost(
    _env: JNIEnv, _class: JClass, handle: jlong, mailbox: jint,
) -> jlong {
    with_channel(handle, |channel| channel.unpost(non_negative(mailbox as jlong)?))
}

fn query<F>(env: &mut JNIEnv, handle: jlong, f: F) -> jboolean
where
    F: FnOnce(&mut ShmChannel) -> Result<bool, IpcError>,
{
    match unsafe { borrow_handle::<ShmChannel>(handle) }.and_then(f) {
        Ok(value) => from_bool(value),
        Err(e) => {
            throw(env, &e);
            JNI_FALSE
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_isMessageAvailable(
    mut env: JNIEnv, _class: JClass, handle: jlong, mailbox: jint,
) -> jboolean {
    query(&mut env, handle, |channel| {
        channel.is_message_available(non_negative(mailbox as jlong)?)
    })
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_canWriteMessage(
    mut env: JNIEnv, _class: JClass, handle: jlong, mailbox: jint,
) -> jboolean {
    query(&mut env, handle, |channel| {
        channel.can_write_message(non_negative(mailbox as jlong)?)
    })
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_isOpen(
    mut env: JNIEnv, _class: JClass, handle: jlong,
) -> jboolean {
    query(&mut env, handle, |channel| Ok(channel.is_open()))
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_isOwner(
    mut env: JNIEnv, _class: JClass, handle: jlong,
) -> jboolean {
    query(&mut env, handle, |channel| Ok(channel.is_owner()))
}

/// 0 tries once, negative waits forever, otherwise milliseconds.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_lock(
    mut env: JNIEnv, _class: JClass, handle: jlong, millis: jlong,
) -> jboolean {
    query(&mut env, handle, |channel| channel.lock(millis))
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_unlock(
    _env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    with_channel(handle, |channel| channel.unlock())
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_size(
    mut env: JNIEnv, _class: JClass, handle: jlong,
) -> jlong {
    match unsafe { borrow_handle::<ShmChannel>(handle) }.and_then(|channel| channel.size()) {
        Ok(size) => size as jlong,
        Err(e) => {
            throw(&mut env, &e);
            -1
        }
    }
}

/// Direct `ByteBuffer` over `[offset, offset + length)` of the payload. It
/// must not be used once the channel is closed.
#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_buffer<'local>(
    mut env: JNIEnv<'local>, _class: JClass<'local>, handle: jlong, offset: jlong, length: jlong,
) -> jobject {
    let region = unsafe { borrow_handle::<ShmChannel>(handle) }.and_then(|channel| {
        let (offset, length) = (non_negative(offset)?, non_negative(length)?);
        channel.buffer(offset, length)?;
        Ok((channel.raw_buffer(offset)?, length))
    });
    let (data, length) = match region {
        Ok(region) => region,
        Err(e) => {
            throw(&mut env, &e);
            return ptr::null_mut();
        }
    };
    match unsafe { env.new_direct_byte_buffer(data, length) } {
        Ok(buffer) => JObject::from(buffer).into_raw(),
        Err(e) => {
            let err = IpcError::Native {
                status: Status::from_code(ErrorCode::InvalidState),
                message: format!("could not wrap the segment in a direct buffer: {}", e),
            };
            throw(&mut env, &err);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_shmbox_ShmChannel_implementationName<'local>(
    mut env: JNIEnv<'local>, _class: JClass<'local>, handle: jlong,
) -> jstring {
    let name = match unsafe { borrow_handle::<ShmChannel>(handle) } {
        Ok(channel) => channel.implementation_name(),
        Err(e) => {
            throw(&mut env, &e);
            return ptr::null_mut();
        }
    };
    match env.new_string(name) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("could not allocate implementation name: {}", e);
            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_shape() {
        let config: JniConfig = toml::from_str(
            r#"
            log_level = 3

            [channel]
            name = "frame-channel"
            size = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, Some(3));
        assert_eq!(config.channel.name, "frame-channel");
        assert_eq!(config.channel.size, 8192);
        assert_eq!(config.channel.mailboxes, 1);
    }

    #[test]
    fn channel_status_codes() {
        let handle = into_handle(ShmChannel::new("shmbox-jni-status"));
        let not_open = with_channel(handle, |channel| channel.post(0));
        assert_eq!(
            Status::from_raw(not_open as u64).library_code(),
            Some(ErrorCode::NotOpen)
        );
        assert_eq!(
            with_channel(0, |_| Ok(())),
            Status::from_code(ErrorCode::NullRef).raw() as jlong
        );
        unsafe { release_handle::<ShmChannel>(handle) };
    }
}
