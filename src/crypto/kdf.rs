//! HKDF-SHA256 (RFC 5869) over ring's HMAC

use ring::hmac;

const HASH_LEN: usize = 32;

/// PRK = HMAC-SHA256(salt, IKM). A missing salt is 32 zero bytes.
pub fn extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; 32] {
    let zero_salt = [0u8; HASH_LEN];
    let key = hmac::Key::new(hmac::HMAC_SHA256, salt.unwrap_or(&zero_salt));
    let tag = hmac::sign(&key, ikm);
    let mut prk = [0u8; HASH_LEN];
    prk.copy_from_slice(tag.as_ref());
    prk
}

/// OKM = T(1) || T(2) || ... truncated to `N` bytes
pub fn expand<const N: usize>(prk: &[u8; 32], info: &[u8]) -> [u8; N] {
    debug_assert!(N <= 255 * HASH_LEN);

    let key = hmac::Key::new(hmac::HMAC_SHA256, prk);
    let mut okm = [0u8; N];
    let mut previous: Vec<u8> = Vec::new();
    let mut written = 0;
    let mut counter = 1u8;

    while written < N {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&previous);
        ctx.update(info);
        ctx.update(&[counter]);
        let block = ctx.sign();

        let take = (N - written).min(HASH_LEN);
        okm[written..written + take].copy_from_slice(&block.as_ref()[..take]);
        written += take;
        previous = block.as_ref().to_vec();
        counter = counter.wrapping_add(1);
    }

    okm
}

/// Extract-then-expand
pub fn derive<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; N] {
    expand(&extract(salt, ikm), info)
}

/// Derive two independent 32-byte keys
pub fn derive_pair(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let okm: [u8; 64] = derive(salt, ikm, info);
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

/// Symmetric chain step: (message key, next chain key)
pub fn chain_step(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let key = hmac::Key::new(hmac::HMAC_SHA256, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain = [0u8; 32];
    message_key.copy_from_slice(hmac::sign(&key, &[0x01]).as_ref());
    next_chain.copy_from_slice(hmac::sign(&key, &[0x02]).as_ref());
    (message_key, next_chain)
}
