// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Secure storage and the file protector.

use std::ffi::c_char;

use crate::buffer::{TakByteBufferResponse, bytes_in, str_in};
use crate::{TakSession, call, session, success};

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_storage_create(handle: *mut TakSession, name: *const c_char) -> i32 {
    call(|| unsafe {
        session(handle)?.storage_create(str_in(name, "storage name")?)?;
        success()
    })
}

/// Insert or replace `key` in store `name`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_storage_write(
    handle: *mut TakSession,
    name: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
) -> i32 {
    call(|| unsafe {
        session(handle)?.storage_write(
            str_in(name, "storage name")?,
            str_in(key, "storage key")?,
            bytes_in(value, value_len)?,
        )?;
        success()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_storage_read(
    handle: *mut TakSession,
    name: *const c_char,
    key: *const c_char,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let value = session(handle)?
            .storage_read(str_in(name, "storage name")?, str_in(key, "storage key")?)?;
        Ok(TakByteBufferResponse::ok(value))
    })
}

/// Succeeds when `key` is absent.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_storage_delete_entry(
    handle: *mut TakSession,
    name: *const c_char,
    key: *const c_char,
) -> i32 {
    call(|| unsafe {
        session(handle)?
            .storage_delete_entry(str_in(name, "storage name")?, str_in(key, "storage key")?)?;
        success()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_storage_delete(handle: *mut TakSession, name: *const c_char) -> i32 {
    call(|| unsafe {
        session(handle)?.storage_delete(str_in(name, "storage name")?)?;
        success()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_file_protector_encrypt(
    handle: *mut TakSession,
    data: *const u8,
    data_len: usize,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let sealed = session(handle)?.file_protector_encrypt(bytes_in(data, data_len)?)?;
        Ok(TakByteBufferResponse::ok(sealed))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_file_protector_decrypt(
    handle: *mut TakSession,
    data: *const u8,
    data_len: usize,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let clear = session(handle)?.file_protector_decrypt(bytes_in(data, data_len)?)?;
        Ok(TakByteBufferResponse::ok(clear))
    })
}

/// Decrypt the bundled asset `<name>.<extension>`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_file_protector_decrypt_from_file(
    handle: *mut TakSession,
    name: *const c_char,
    extension: *const c_char,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let clear = session(handle)?.file_protector_decrypt_from_file(
            str_in(name, "asset name")?,
            str_in(extension, "asset extension")?,
        )?;
        Ok(TakByteBufferResponse::ok(clear))
    })
}
