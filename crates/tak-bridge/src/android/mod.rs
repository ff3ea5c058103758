// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Android host via JNI.
//
// The application context is a capability handed to `AndroidHost` at
// construction, either explicitly (`from_raw`, used by the C entry point
// that receives the `JavaVM*` and context `jobject`) or from the NDK glue
// (`from_ndk_context`). The host keeps a global reference to it; the session
// only uses it between `attach` and `detach`.

#![cfg(target_os = "android")]

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use jni::objects::{GlobalRef, JObject, JString, JValue};
use jni::{JNIEnv, JavaVM};

use tak_core::error::{Result, TakError};
use tak_core::{RootStatus, RuntimeCrashReason};

use crate::traits::*;

const READ_CHUNK: i32 = 8192;

/// Convenience: map any `jni::errors::Error` into `TakError::Bridge`.
fn jni_err(context: &str, e: jni::errors::Error) -> TakError {
    TakError::Bridge(format!("{context}: {e}"))
}

/// Android implementation of the host environment.
pub struct AndroidHost {
    vm: Option<JavaVM>,
    context: Option<GlobalRef>,
    attached: AtomicBool,
}

impl AndroidHost {
    /// Build from the process-wide NDK context. A missing context yields a
    /// host whose `attach` fails.
    pub fn from_ndk_context() -> Self {
        let ctx = std::panic::catch_unwind(ndk_context::android_context);
        match ctx {
            // SAFETY: the NDK glue stores a valid `JavaVM*` and a global
            // `jobject` for the hosting context before native code runs.
            Ok(ctx) => unsafe { Self::from_raw(ctx.vm(), ctx.context()) },
            Err(_) => {
                tracing::warn!("Android NDK context not initialised");
                Self::detached()
            }
        }
    }

    /// Build from raw JNI handles.
    ///
    /// # Safety
    ///
    /// `vm` must be a valid `JavaVM*` and `context` a valid `jobject` for an
    /// `android.content.Context`, or null.
    pub unsafe fn from_raw(vm: *mut c_void, context: *mut c_void) -> Self {
        if vm.is_null() || context.is_null() {
            return Self::detached();
        }
        // SAFETY: upheld by the caller.
        let vm = match unsafe { JavaVM::from_raw(vm.cast()) } {
            Ok(vm) => vm,
            Err(e) => {
                tracing::warn!(error = %e, "invalid JavaVM pointer");
                return Self::detached();
            }
        };
        let context = {
            let env = match vm.attach_current_thread_permanently() {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to attach JNI thread");
                    return Self::detached();
                }
            };
            // SAFETY: upheld by the caller.
            let obj = unsafe { JObject::from_raw(context.cast()) };
            match env.new_global_ref(obj) {
                Ok(global) => Some(global),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to pin Android context");
                    None
                }
            }
        };
        Self {
            vm: Some(vm),
            context,
            attached: AtomicBool::new(false),
        }
    }

    fn detached() -> Self {
        Self {
            vm: None,
            context: None,
            attached: AtomicBool::new(false),
        }
    }

    fn env(&self) -> Result<(JNIEnv<'_>, &GlobalRef)> {
        if !self.is_attached() {
            return Err(TakError::Bridge("Android context is not attached".into()));
        }
        let (Some(vm), Some(ctx)) = (self.vm.as_ref(), self.context.as_ref()) else {
            return Err(TakError::Bridge("Android context is unavailable".into()));
        };
        let env = vm
            .attach_current_thread_permanently()
            .map_err(|e| jni_err("attach_current_thread", e))?;
        Ok((env, ctx))
    }
}

impl HostEnvironment for AndroidHost {
    fn platform_name(&self) -> &str {
        "Android"
    }
}

impl HostContext for AndroidHost {
    fn requires_context(&self) -> bool {
        true
    }

    fn attach(&self) -> Result<()> {
        if self.vm.is_none() || self.context.is_none() {
            return Err(TakError::invalid("Android application context was not supplied"));
        }
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

impl DeviceFingerprint for AndroidHost {
    /// `Settings.Secure.ANDROID_ID`, scoped per app signing key.
    fn device_fingerprint(&self) -> Result<Option<String>> {
        let (mut env, ctx) = self.env()?;

        let resolver = env
            .call_method(
                ctx.as_obj(),
                "getContentResolver",
                "()Landroid/content/ContentResolver;",
                &[],
            )
            .map_err(|e| jni_err("Context.getContentResolver", e))?
            .l()
            .map_err(|e| jni_err("getContentResolver->l", e))?;

        let key = env
            .new_string("android_id")
            .map_err(|e| jni_err("new_string(android_id)", e))?;

        let id = env
            .call_static_method(
                "android/provider/Settings$Secure",
                "getString",
                "(Landroid/content/ContentResolver;Ljava/lang/String;)Ljava/lang/String;",
                &[JValue::Object(&resolver), JValue::Object(&key)],
            )
            .map_err(|e| jni_err("Settings.Secure.getString", e))?
            .l()
            .map_err(|e| jni_err("getString->l", e))?;

        if id.is_null() {
            return Ok(None);
        }
        let id = JString::from(id);
        let id: String = env
            .get_string(&id)
            .map_err(|e| jni_err("get_string(android_id)", e))?
            .into();
        Ok((!id.is_empty()).then_some(id))
    }
}

impl BundledAssets for AndroidHost {
    /// Read `assets/<name>` from the APK through `AssetManager`.
    fn open_asset(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let (mut env, ctx) = self.env()?;

        let assets = env
            .call_method(
                ctx.as_obj(),
                "getAssets",
                "()Landroid/content/res/AssetManager;",
                &[],
            )
            .map_err(|e| jni_err("Context.getAssets", e))?
            .l()
            .map_err(|e| jni_err("getAssets->l", e))?;

        let j_name = env
            .new_string(name)
            .map_err(|e| jni_err("new_string(name)", e))?;

        let stream = match env.call_method(
            &assets,
            "open",
            "(Ljava/lang/String;)Ljava/io/InputStream;",
            &[JValue::Object(&j_name)],
        ) {
            Ok(v) => v.l().map_err(|e| jni_err("open->l", e))?,
            // FileNotFoundException
            Err(jni::errors::Error::JavaException) => {
                env.exception_clear()
                    .map_err(|e| jni_err("exception_clear", e))?;
                return Ok(None);
            }
            Err(e) => return Err(jni_err("AssetManager.open", e)),
        };

        let chunk = env
            .new_byte_array(READ_CHUNK)
            .map_err(|e| jni_err("new_byte_array", e))?;
        let mut buf = vec![0i8; READ_CHUNK as usize];
        let mut out = Vec::new();
        loop {
            let n = env
                .call_method(&stream, "read", "([B)I", &[JValue::Object(&chunk)])
                .map_err(|e| jni_err("InputStream.read", e))?
                .i()
                .map_err(|e| jni_err("read->i", e))?;
            if n < 0 {
                break;
            }
            let n = n as usize;
            env.get_byte_array_region(&chunk, 0, &mut buf[..n])
                .map_err(|e| jni_err("get_byte_array_region", e))?;
            out.extend(buf[..n].iter().map(|b| *b as u8));
        }

        env.call_method(&stream, "close", "()V", &[])
            .map_err(|e| jni_err("InputStream.close", e))?;

        tracing::debug!(asset = name, len = out.len(), "Android: asset read");
        Ok(Some(out))
    }
}

impl RuntimeIntegrity for AndroidHost {
    fn root_status(&self) -> RootStatus {
        RootStatus::NotRooted
    }

    fn scan(&self) -> Option<RuntimeCrashReason> {
        crate::tracer::is_traced().then_some(RuntimeCrashReason::DebuggerDetected)
    }
}
