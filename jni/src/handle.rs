//! Boxed Rust values handed to Java as opaque `long`s.

use jni::sys::jlong;
use shmbox::{IpcError, StateError};

pub fn into_handle<T>(value: T) -> jlong {
    Box::into_raw(Box::new(value)) as jlong
}

/// # Safety
/// `handle` must be zero or come from [`into_handle`] with the same `T` and
/// not have been released.
pub unsafe fn borrow_handle<'a, T>(handle: jlong) -> Result<&'a mut T, IpcError> {
    if handle == 0 {
        return Err(StateError::NullHandle.into());
    }
    Ok(&mut *(handle as *mut T))
}

/// # Safety
/// Same as [`borrow_handle`]. The handle is dangling afterwards.
pub unsafe fn release_handle<T>(handle: jlong) -> Option<T> {
    if handle == 0 {
        return None;
    }
    Some(*Box::from_raw(handle as *mut T))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip() {
        let handle = into_handle(String::from("frame-channel"));
        assert_ne!(handle, 0);
        unsafe {
            borrow_handle::<String>(handle).unwrap().push_str("-2");
            assert_eq!(release_handle::<String>(handle).as_deref(), Some("frame-channel-2"));
        }
    }

    #[test]
    fn null_handle() {
        unsafe {
            let err = borrow_handle::<String>(0).unwrap_err();
            assert!(matches!(err, IpcError::State(StateError::NullHandle)));
            assert!(release_handle::<String>(0).is_none());
        }
    }
}
