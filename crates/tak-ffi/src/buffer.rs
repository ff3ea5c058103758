// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Byte buffers and response structs crossing the C boundary.
//
// Outward buffers and strings are fresh Rust allocations owned by the caller
// until handed back to `tak_buffer_free` / `tak_string_free`. Inward
// pointers are borrowed for the duration of one call.

use std::ffi::{CStr, CString, c_char};
use std::ptr;

use tak_core::error::{Result, TakError};
use tak_core::{EncryptionOutput, KeyInfo, StatusCode};

/// `{data, length}`. `{NULL, 0}` means no data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TakByteBuffer {
    pub data: *mut u8,
    pub length: usize,
}

impl TakByteBuffer {
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            length: 0,
        }
    }

    /// Hand `bytes` to the caller.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        let boxed = bytes.into_boxed_slice();
        let length = boxed.len();
        Self {
            data: Box::into_raw(boxed).cast::<u8>(),
            length,
        }
    }

    /// Borrow the bytes of an inbound buffer.
    ///
    /// # Safety
    ///
    /// `data` must be null or valid for reads of `length` bytes for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> Result<&'a [u8]> {
        // SAFETY: forwarded to the caller.
        unsafe { bytes_in(self.data, self.length) }
    }
}

/// Borrow `len` bytes at `data`. A null pointer is only valid with `len == 0`.
///
/// # Safety
///
/// `data` must be null or valid for reads of `len` bytes for `'a`.
pub unsafe fn bytes_in<'a>(data: *const u8, len: usize) -> Result<&'a [u8]> {
    if data.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(TakError::invalid("null buffer with non-zero length"))
        };
    }
    // SAFETY: non-null, and the caller guarantees the length.
    Ok(unsafe { std::slice::from_raw_parts(data, len) })
}

/// Borrow a required UTF-8 C string.
///
/// # Safety
///
/// `s` must be null or a valid NUL-terminated string for `'a`.
pub unsafe fn str_in<'a>(s: *const c_char, what: &str) -> Result<&'a str> {
    // SAFETY: forwarded to the caller.
    unsafe { opt_str_in(s, what) }?.ok_or_else(|| TakError::invalid(format!("{what} is null")))
}

/// Borrow an optional UTF-8 C string; null means absent.
///
/// # Safety
///
/// `s` must be null or a valid NUL-terminated string for `'a`.
pub unsafe fn opt_str_in<'a>(s: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if s.is_null() {
        return Ok(None);
    }
    // SAFETY: non-null, NUL-terminated per the caller.
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map(Some)
        .map_err(|_| TakError::invalid(format!("{what} is not valid UTF-8")))
}

/// Hand `s` to the caller as a NUL-terminated string.
pub fn string_out(s: String) -> Result<*mut c_char> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| TakError::General("string contains an interior NUL".into()))
}

/// Release a buffer returned by any `tak_*` function. Null is ignored.
///
/// # Safety
///
/// `buffer` must come from this library and must not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_buffer_free(buffer: TakByteBuffer) {
    if buffer.data.is_null() {
        return;
    }
    let slice = ptr::slice_from_raw_parts_mut(buffer.data, buffer.length);
    // SAFETY: produced by `from_vec` from a boxed slice of this length.
    drop(unsafe { Box::from_raw(slice) });
}

/// Release a string returned by any `tak_*` function. Null is ignored.
///
/// # Safety
///
/// `s` must come from this library and must not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_string_free(s: *mut c_char) {
    if !s.is_null() {
        // SAFETY: produced by `CString::into_raw` in `string_out`.
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Release every buffer of an encryption output.
///
/// # Safety
///
/// Same as [`tak_buffer_free`] for each field.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_encryption_output_free(output: TakEncryptionOutput) {
    // SAFETY: forwarded to the caller.
    unsafe {
        tak_buffer_free(output.iv);
        tak_buffer_free(output.aad);
        tak_buffer_free(output.tag);
        tak_buffer_free(output.ephemeral_key);
        tak_buffer_free(output.ciphertext);
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A value that can report a failed call.
pub trait Response: Sized {
    fn failed(code: StatusCode) -> Self;
}

impl Response for i32 {
    fn failed(code: StatusCode) -> Self {
        code.code()
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakByteBufferResponse {
    pub return_code: i32,
    pub buffer: TakByteBuffer,
}

impl TakByteBufferResponse {
    pub fn ok(bytes: Vec<u8>) -> Self {
        Self {
            return_code: StatusCode::Success.code(),
            buffer: TakByteBuffer::from_vec(bytes),
        }
    }
}

impl Response for TakByteBufferResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            buffer: TakByteBuffer::empty(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakStringResponse {
    pub return_code: i32,
    pub value: *mut c_char,
}

impl TakStringResponse {
    pub fn ok(value: String) -> Result<Self> {
        Ok(Self {
            return_code: StatusCode::Success.code(),
            value: string_out(value)?,
        })
    }
}

impl Response for TakStringResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            value: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakIsRegisteredResponse {
    pub is_registered: bool,
    /// Diagnostic only.
    pub return_code: i32,
}

#[repr(C)]
#[derive(Debug)]
pub struct TakBoolResponse {
    pub return_code: i32,
    pub value: bool,
}

impl TakBoolResponse {
    pub fn ok(value: bool) -> Self {
        Self {
            return_code: StatusCode::Success.code(),
            value,
        }
    }
}

impl Response for TakBoolResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            value: false,
        }
    }
}

/// Integer-valued answer (root level, state).
#[repr(C)]
#[derive(Debug)]
pub struct TakIntResponse {
    pub return_code: i32,
    pub value: i32,
}

impl TakIntResponse {
    pub fn ok(value: i32) -> Self {
        Self {
            return_code: StatusCode::Success.code(),
            value,
        }
    }
}

impl Response for TakIntResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            value: -1,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakTlsConnectResponse {
    pub return_code: i32,
    pub descriptor: i32,
    /// PEM of the peer's leaf certificate.
    pub peer_certificate: *mut c_char,
}

impl Response for TakTlsConnectResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            descriptor: -1,
            peer_certificate: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TakEncryptionOutput {
    pub iv: TakByteBuffer,
    pub aad: TakByteBuffer,
    pub tag: TakByteBuffer,
    pub ephemeral_key: TakByteBuffer,
    pub ciphertext: TakByteBuffer,
}

impl TakEncryptionOutput {
    pub fn empty() -> Self {
        Self {
            iv: TakByteBuffer::empty(),
            aad: TakByteBuffer::empty(),
            tag: TakByteBuffer::empty(),
            ephemeral_key: TakByteBuffer::empty(),
            ciphertext: TakByteBuffer::empty(),
        }
    }

    pub fn from_output(output: EncryptionOutput) -> Self {
        Self {
            iv: TakByteBuffer::from_vec(output.iv),
            aad: TakByteBuffer::from_vec(output.aad),
            tag: TakByteBuffer::from_vec(output.tag),
            ephemeral_key: TakByteBuffer::from_vec(output.ephemeral_key),
            ciphertext: TakByteBuffer::from_vec(output.ciphertext),
        }
    }

    /// Copy an inbound output into owned form.
    ///
    /// # Safety
    ///
    /// Every buffer must satisfy [`TakByteBuffer::as_slice`].
    pub unsafe fn to_output(&self) -> Result<EncryptionOutput> {
        // SAFETY: forwarded to the caller.
        unsafe {
            Ok(EncryptionOutput {
                iv: self.iv.as_slice()?.to_vec(),
                aad: self.aad.as_slice()?.to_vec(),
                tag: self.tag.as_slice()?.to_vec(),
                ephemeral_key: self.ephemeral_key.as_slice()?.to_vec(),
                ciphertext: self.ciphertext.as_slice()?.to_vec(),
            })
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakEncryptResponse {
    pub return_code: i32,
    pub output: TakEncryptionOutput,
}

impl Response for TakEncryptResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            output: TakEncryptionOutput::empty(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TakKeyInfoResponse {
    pub return_code: i32,
    pub algorithm: i32,
    pub protection_level: i32,
}

impl TakKeyInfoResponse {
    pub fn ok(info: &KeyInfo) -> Self {
        Self {
            return_code: StatusCode::Success.code(),
            algorithm: info.algorithm as i32,
            protection_level: info.protection_level as i32,
        }
    }
}

impl Response for TakKeyInfoResponse {
    fn failed(code: StatusCode) -> Self {
        Self {
            return_code: code.code(),
            algorithm: -1,
            protection_level: -1,
        }
    }
}

/// Wrapped key material handed in by the caller. All pointers are borrowed.
#[repr(C)]
#[derive(Debug)]
pub struct TakWrappedKey {
    pub wrapped: TakEncryptionOutput,
    pub algorithm: i32,
    pub wrapping_algorithm: i32,
    pub wrapping_key_alias: *const c_char,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_round_trip_through_free() {
        let buf = TakByteBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buf.length, 3);
        assert_eq!(unsafe { buf.as_slice() }.unwrap(), &[1, 2, 3]);
        unsafe { tak_buffer_free(buf) };
    }

    #[test]
    fn empty_output_is_null() {
        let buf = TakByteBuffer::from_vec(Vec::new());
        assert!(buf.data.is_null());
        assert_eq!(buf.length, 0);
        unsafe { tak_buffer_free(buf) };
    }

    #[test]
    fn null_input_needs_zero_length() {
        assert!(unsafe { bytes_in(ptr::null(), 0) }.unwrap().is_empty());
        assert!(unsafe { bytes_in(ptr::null(), 4) }.is_err());
    }

    #[test]
    fn strings() {
        let s = string_out("hello".into()).unwrap();
        assert_eq!(unsafe { str_in(s, "s") }.unwrap(), "hello");
        unsafe { tak_string_free(s) };

        assert!(unsafe { str_in(ptr::null(), "alias") }.is_err());
        assert_eq!(unsafe { opt_str_in(ptr::null(), "hash") }.unwrap(), None);
        assert!(string_out("a\0b".into()).is_err());
    }

    #[test]
    fn failures_carry_no_data() {
        let r = TakByteBufferResponse::failed(StatusCode::NotRegistered);
        assert_eq!(r.return_code, StatusCode::NotRegistered.code());
        assert!(r.buffer.data.is_null());
        let r = TakTlsConnectResponse::failed(StatusCode::NetworkTimeout);
        assert!(r.peer_certificate.is_null());
    }
}
