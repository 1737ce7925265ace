//! Owned containers for raw master keys, derived key/IV pairs and
//! decrypted item plaintext.
//!
//! - [`SecretBuffer`] — variable length; what the key agent holds and what
//!   `decrypt` returns
//! - [`SecretBytes`] — fixed length; the 16-byte AES key and IV
//!
//! Both zero their contents on drop, try to keep their pages out of swap,
//! and print as `***`.

use crate::error::KeychainError;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Page locking
// ---------------------------------------------------------------------------

/// `mlock` guard for one allocation; `munlock` on drop.
pub(crate) struct LockedRegion {
    ptr: *const u8,
    len: usize,
    locked: bool,
}

// SAFETY: the pointer is only passed to mlock/munlock and never
// dereferenced here; the bytes belong to the owning container.
unsafe impl Send for LockedRegion {}
unsafe impl Sync for LockedRegion {}

impl LockedRegion {
    /// Lock `len` bytes at `ptr`. A refused `mlock` (quota, privileges)
    /// leaves the region unlocked.
    fn try_lock(ptr: *const u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            locked: platform::try_mlock(ptr, len),
        }
    }

    const fn none() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
            locked: false,
        }
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        if self.locked {
            platform::try_munlock(self.ptr, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// SecretBuffer
// ---------------------------------------------------------------------------

/// Heap secret of any length.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
    lock: LockedRegion,
}

impl SecretBuffer {
    /// Copy `data` into a new buffer. The caller still owns (and should
    /// wipe) the source.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps room for allocators that
    /// can refuse locked memory.
    pub fn new(data: &[u8]) -> Result<Self, KeychainError> {
        Ok(Self::from_vec(data.to_vec()))
    }

    /// Adopt `data` as-is.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let inner: SecretSlice<u8> = data.into();
        let bytes = inner.expose_secret();
        let lock = LockedRegion::try_lock(bytes.as_ptr(), bytes.len());
        Self { inner, lock }
    }

    /// `len` bytes from the OS CSPRNG. Used for fresh master keys.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::SecureMemory` if the CSPRNG fails.
    pub fn random(len: usize) -> Result<Self, KeychainError> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeychainError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
        Ok(Self::from_vec(bytes))
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compare with `other` in constant time (for equal lengths).
    #[must_use]
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        constant_time_eq(self.expose(), other)
    }

    /// Whether `mlock` succeeded for this buffer.
    #[must_use]
    pub const fn is_mlocked(&self) -> bool {
        self.lock.locked
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

impl fmt::Display for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>
// ---------------------------------------------------------------------------

/// Inline secret of exactly `N` bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
    #[zeroize(skip)]
    lock: LockedRegion,
}

impl<const N: usize> SecretBytes<N> {
    /// Take `data` by value. The lock covers the address at construction;
    /// once moved, only zeroize-on-drop still applies.
    #[must_use]
    pub fn new(data: [u8; N]) -> Self {
        let mut s = Self {
            bytes: data,
            lock: LockedRegion::none(),
        };
        s.lock = LockedRegion::try_lock(s.bytes.as_ptr(), N);
        s
    }

    /// Copy exactly `N` bytes out of `slice`.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::InvalidKeyMaterial` on a length mismatch.
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeychainError> {
        let mut bytes: [u8; N] = slice.try_into().map_err(|_| {
            KeychainError::InvalidKeyMaterial(format!(
                "expected {N} bytes, got {}",
                slice.len()
            ))
        })?;
        let secret = Self::new(bytes);
        bytes.zeroize();
        Ok(secret)
    }

    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> fmt::Display for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Byte equality without a data-dependent early exit. Differing lengths
/// return `false` immediately.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Set `RLIMIT_CORE` to zero so a crash cannot write unlocked keys to disk.
/// No-op off Unix.
///
/// # Errors
///
/// Returns `KeychainError::SecureMemory` if `setrlimit` fails.
pub fn disable_core_dumps() -> Result<(), KeychainError> {
    platform::disable_core_dumps()
}

#[cfg(unix)]
mod platform {
    use crate::error::KeychainError;

    pub(super) fn try_mlock(ptr: *const u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        // SAFETY: an invalid range makes mlock fail with ENOMEM; no memory
        // is touched.
        unsafe { libc::mlock(ptr.cast(), len) == 0 }
    }

    pub(super) fn try_munlock(ptr: *const u8, len: usize) {
        if len != 0 {
            // SAFETY: see try_mlock; failure is ignored.
            unsafe {
                libc::munlock(ptr.cast(), len);
            }
        }
    }

    pub(super) fn disable_core_dumps() -> Result<(), KeychainError> {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: plain POSIX call on a stack value.
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) } != 0 {
            return Err(KeychainError::SecureMemory(
                "setrlimit(RLIMIT_CORE, 0) failed".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod platform {
    use crate::error::KeychainError;

    pub(super) const fn try_mlock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub(super) const fn try_munlock(_ptr: *const u8, _len: usize) {}

    pub(super) const fn disable_core_dumps() -> Result<(), KeychainError> {
        Ok(())
    }
}
