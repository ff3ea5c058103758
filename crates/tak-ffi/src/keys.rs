// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Certificates, signing, encryption, and key management.
//
// Algorithm parameters are the raw `#[repr(i32)]` values of the tak-core
// enums; unknown values are `InvalidParameter`.

use std::ffi::c_char;

use tak_core::error::TakError;
use tak_core::{
    EncryptionAlgorithm, HashAlgorithm, KeyAlgorithm, Padding, SignatureAlgorithm, StatusCode,
    WrappedKey, WrappingAlgorithm, alias,
};

use crate::buffer::{
    TakByteBufferResponse, TakEncryptResponse, TakEncryptionOutput, TakKeyInfoResponse,
    TakStringResponse, TakWrappedKey, bytes_in, str_in,
};
use crate::{TakSession, call, session, success};

/// PEM certificate of the key at `key_alias`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_certificate_pem(
    handle: *mut TakSession,
    key_alias: *const c_char,
) -> TakStringResponse {
    call(|| unsafe {
        let pem = session(handle)?.certificate_pem(str_in(key_alias, "alias")?)?;
        TakStringResponse::ok(pem)
    })
}

/// PEM of the device's individual client certificate.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_client_certificate(handle: *mut TakSession) -> TakStringResponse {
    call(|| unsafe {
        TakStringResponse::ok(session(handle)?.certificate_pem(alias::INDIVIDUAL_CLIENT_PRIVATE)?)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_key_info(
    handle: *mut TakSession,
    key_alias: *const c_char,
) -> TakKeyInfoResponse {
    call(|| unsafe {
        let info = session(handle)?.key_info(str_in(key_alias, "alias")?)?;
        Ok(TakKeyInfoResponse::ok(&info))
    })
}

/// Uncompressed SEC1 point for EC keys.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_public_key(
    handle: *mut TakSession,
    key_alias: *const c_char,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let key = session(handle)?.public_key(str_in(key_alias, "alias")?)?;
        Ok(TakByteBufferResponse::ok(key))
    })
}

/// Hash `data` with `hash_algorithm` and sign the digest.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_sign(
    handle: *mut TakSession,
    key_alias: *const c_char,
    signature_algorithm: i32,
    hash_algorithm: i32,
    data: *const u8,
    data_len: usize,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let signature = session(handle)?.sign(
            str_in(key_alias, "alias")?,
            SignatureAlgorithm::from_raw(signature_algorithm)?,
            HashAlgorithm::from_raw(hash_algorithm)?,
            bytes_in(data, data_len)?,
        )?;
        Ok(TakByteBufferResponse::ok(signature))
    })
}

/// ECDSA over SHA-256 with the customer-wide default key.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_sign_with_default_key(
    handle: *mut TakSession,
    data: *const u8,
    data_len: usize,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let signature = session(handle)?.sign(
            alias::DEFAULT_CLIENT_PRIVATE,
            SignatureAlgorithm::Ecdsa,
            HashAlgorithm::Sha256,
            bytes_in(data, data_len)?,
        )?;
        Ok(TakByteBufferResponse::ok(signature))
    })
}

/// `iv` may be null, in which case a fresh one is generated.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_encrypt(
    handle: *mut TakSession,
    key_alias: *const c_char,
    algorithm: i32,
    padding: i32,
    cleartext: *const u8,
    cleartext_len: usize,
    iv: *const u8,
    iv_len: usize,
) -> TakEncryptResponse {
    call(|| unsafe {
        let iv = if iv.is_null() {
            None
        } else {
            Some(bytes_in(iv, iv_len)?)
        };
        let output = session(handle)?.encrypt(
            str_in(key_alias, "alias")?,
            EncryptionAlgorithm::from_raw(algorithm)?,
            Padding::from_raw(padding)?,
            bytes_in(cleartext, cleartext_len)?,
            iv,
        )?;
        Ok(TakEncryptResponse {
            return_code: StatusCode::Success.code(),
            output: TakEncryptionOutput::from_output(output),
        })
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_decrypt(
    handle: *mut TakSession,
    key_alias: *const c_char,
    algorithm: i32,
    padding: i32,
    encrypted: *const TakEncryptionOutput,
) -> TakByteBufferResponse {
    call(|| unsafe {
        let encrypted = encrypted
            .as_ref()
            .ok_or_else(|| TakError::invalid("encryption output is null"))?
            .to_output()?;
        let clear = session(handle)?.decrypt(
            str_in(key_alias, "alias")?,
            EncryptionAlgorithm::from_raw(algorithm)?,
            Padding::from_raw(padding)?,
            &encrypted,
        )?;
        Ok(TakByteBufferResponse::ok(clear))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_generate_random(
    handle: *mut TakSession,
    len: usize,
) -> TakByteBufferResponse {
    call(|| unsafe { Ok(TakByteBufferResponse::ok(session(handle)?.generate_random(len)?)) })
}

/// Generate a key under a caller-chosen, non-reserved alias.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_generate_key(
    handle: *mut TakSession,
    key_alias: *const c_char,
    algorithm: i32,
) -> i32 {
    call(|| unsafe {
        let algorithm = KeyAlgorithm::from_raw(algorithm)?;
        session(handle)?.generate_key(str_in(key_alias, "alias")?, algorithm)?;
        success()
    })
}

/// Unwrap `wrapped` into the vault under `key_alias`. Nothing in `wrapped`
/// is retained.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_load_wrapped_key(
    handle: *mut TakSession,
    wrapped: *const TakWrappedKey,
    key_alias: *const c_char,
) -> i32 {
    call(|| unsafe {
        let raw = wrapped
            .as_ref()
            .ok_or_else(|| TakError::invalid("wrapped key is null"))?;
        let wrapped = WrappedKey {
            wrapped: raw.wrapped.to_output()?,
            algorithm: KeyAlgorithm::from_raw(raw.algorithm)?,
            wrapping_algorithm: WrappingAlgorithm::from_raw(raw.wrapping_algorithm)?,
            wrapping_key_alias: str_in(raw.wrapping_key_alias, "wrapping key alias")?.to_string(),
        };
        session(handle)?.load_wrapped_key(&wrapped, str_in(key_alias, "alias")?)?;
        success()
    })
}
