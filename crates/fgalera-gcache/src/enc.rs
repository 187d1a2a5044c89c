//! At-rest encryption contract.
//!
//! The cache never constructs ciphers itself: the application injects a
//! streamable callback and rotates keys through
//! [`crate::GCache::set_enc_key`]. The cache guarantees `(key, iv)`
//! uniqueness by deriving each buffer's IV from the page nonce plus the
//! buffer's offset within the page.
//!
//! The [`xor_cfb_cb`] test cipher mirrors the shape of a real CFB-mode
//! callback (block chaining, residual state across `fin = false` calls) and
//! is deliberately trivial. It exists for tests and examples only.

use std::any::Any;
use std::sync::Arc;

use fgalera_error::{GaleraError, Result};
use xxhash_rust::xxh3::xxh3_128;

/// IV width handed to the callback.
pub const IV_SIZE: usize = 16;

/// Cipher direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncDirection {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

/// Per-operation context handed to the callback.
///
/// `state` carries cipher residue between calls of one streamed operation;
/// the callback owns its contents. It is `None` on the first call and is
/// dropped by the caller after a `fin = true` call.
pub struct EncCtx<'a> {
    /// Symmetric key material.
    pub key: &'a [u8],
    /// Initialization vector for this operation.
    pub iv: [u8; IV_SIZE],
    /// Opaque residual state for streamed operations.
    pub state: &'a mut Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for EncCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncCtx")
            .field("key_len", &self.key.len())
            .field("has_state", &self.state.is_some())
            .finish_non_exhaustive()
    }
}

/// Streamable encryption callback.
///
/// Returns the number of output bytes produced. With `fin = false` the
/// callback may consume less than a full block and keep the residue in
/// `ctx.state`; with `fin = true` it must drain everything.
pub type EncryptCb =
    Arc<dyn Fn(&mut EncCtx<'_>, &[u8], &mut [u8], EncDirection, bool) -> Result<usize> + Send + Sync>;

/// Derive the IV for a buffer at `offset` within a page whose nonce is
/// `base`: the 128-bit little-endian sum `base + offset`. Combined with
/// per-page nonce spacing this never repeats for one key.
#[must_use]
pub fn iv_at(base: u128, offset: u64) -> [u8; IV_SIZE] {
    base.wrapping_add(u128::from(offset)).to_le_bytes()
}

/// Run a whole-buffer (single-shot) operation through the callback.
pub fn apply_whole(
    cb: &EncryptCb,
    key: &[u8],
    iv: [u8; IV_SIZE],
    input: &[u8],
    direction: EncDirection,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; input.len()];
    let mut state: Option<Box<dyn Any + Send>> = None;
    let mut ctx = EncCtx {
        key,
        iv,
        state: &mut state,
    };
    let n = cb(&mut ctx, input, &mut out, direction, true)?;
    if n != input.len() {
        return Err(GaleraError::EncryptionFailed {
            detail: format!("short cipher output: {n} of {} bytes", input.len()),
        });
    }
    Ok(out)
}

const BLOCK: usize = 16;

#[derive(Clone)]
struct CfbState {
    iv: [u8; BLOCK],
    key: [u8; BLOCK],
}

fn xor_block(l: &[u8; BLOCK], r: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    for i in 0..BLOCK {
        out[i] = l[i] ^ r[i];
    }
    out
}

/// XOR-CFB test cipher callback.
///
/// Key schedule is a 128-bit hash of the key material; the "block cipher"
/// is a bare XOR. Obviously not secure.
#[must_use]
pub fn xor_cfb_cb() -> EncryptCb {
    Arc::new(|ctx, input, output, direction, fin| {
        let mut st = match ctx.state.take() {
            Some(boxed) => *boxed
                .downcast::<CfbState>()
                .map_err(|_| GaleraError::EncryptionFailed {
                    detail: "foreign cipher state".to_owned(),
                })?,
            None => CfbState {
                iv: ctx.iv,
                key: xxh3_128(ctx.key).to_le_bytes(),
            },
        };

        let mut done = 0usize;
        while input.len() - done > BLOCK || (fin && input.len() - done > 0) {
            let n = (input.len() - done).min(BLOCK);
            let mut b = [0u8; BLOCK];
            b[..n].copy_from_slice(&input[done..done + n]);

            match direction {
                EncDirection::Encrypt => {
                    st.iv = xor_block(&st.key, &st.iv);
                    st.iv = xor_block(&b, &st.iv);
                    output[done..done + n].copy_from_slice(&st.iv[..n]);
                }
                EncDirection::Decrypt => {
                    let pad = xor_block(&st.key, &st.iv);
                    st.iv = b;
                    let plain = xor_block(&b, &pad);
                    output[done..done + n].copy_from_slice(&plain[..n]);
                }
            }
            done += n;
        }

        if !fin {
            *ctx.state = Some(Box::new(st));
        }
        Ok(done)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_buffer_round_trip() {
        let cb = xor_cfb_cb();
        let key = b"0123456789abcdef";
        let iv = iv_at(0xdead_beef, 0);
        let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let cipher = apply_whole(&cb, key, iv, &plain, EncDirection::Encrypt).unwrap();
        assert_ne!(cipher, plain);
        let back = apply_whole(&cb, key, iv, &cipher, EncDirection::Decrypt).unwrap();
        assert_eq!(back, plain);
    }

    #[test]
    fn distinct_keys_and_ivs_give_distinct_ciphertexts() {
        let cb = xor_cfb_cb();
        let plain = vec![0xa5u8; 64];
        let iv = iv_at(1, 0);

        let c1 = apply_whole(&cb, b"key-one", iv, &plain, EncDirection::Encrypt).unwrap();
        let c2 = apply_whole(&cb, b"key-two", iv, &plain, EncDirection::Encrypt).unwrap();
        assert_ne!(c1, c2);

        let c3 = apply_whole(&cb, b"key-one", iv_at(1, 8), &plain, EncDirection::Encrypt).unwrap();
        assert_ne!(c1, c3);
    }

    #[test]
    fn streamed_equals_single_shot() {
        let cb = xor_cfb_cb();
        let key = b"stream-key";
        let iv = iv_at(7, 0);
        let plain: Vec<u8> = (0..200u16).map(|i| (i % 256) as u8).collect();

        let whole = apply_whole(&cb, key, iv, &plain, EncDirection::Encrypt).unwrap();

        // Feed in two chunks with residual state in between.
        let mut out = vec![0u8; plain.len()];
        let mut state: Option<Box<dyn Any + Send>> = None;
        let split = 100;
        let mut ctx = EncCtx {
            key,
            iv,
            state: &mut state,
        };
        let n1 = cb(&mut ctx, &plain[..split], &mut out, EncDirection::Encrypt, false).unwrap();
        assert!(n1 <= split);
        let mut ctx = EncCtx {
            key,
            iv,
            state: &mut state,
        };
        let n2 = cb(
            &mut ctx,
            &plain[n1..],
            &mut out[n1..],
            EncDirection::Encrypt,
            true,
        )
        .unwrap();
        assert_eq!(n1 + n2, plain.len());
        assert_eq!(out, whole);
    }

    #[test]
    fn iv_offsets_never_collide_within_a_page() {
        let base = u128::MAX - 4; // exercise the wrap
        let a = iv_at(base, 0);
        let b = iv_at(base, 8);
        let c = iv_at(base, 16);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }
}
