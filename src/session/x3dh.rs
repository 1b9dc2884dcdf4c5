//! X3DH key agreement
//!
//! DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B),
//! DH4 = DH(EK_A, OPK_B); SK = HKDF(0xFF * 32 || DH1 || DH2 || DH3 || DH4).

use crate::crypto::{kdf, CryptoError, DhKeyPair, IdentityKeyPair, IdentityPublic, PreKeyBundle};
use zeroize::Zeroizing;

const X3DH_INFO: &[u8] = b"ClipMesh_X3DH";

/// Result of the initiator half of the agreement
pub struct Agreement {
    /// Shared secret
    pub shared_secret: Zeroizing<[u8; 32]>,
    /// Ephemeral public key sent to the responder
    pub ephemeral_public: [u8; 32],
    /// One-time prekey id the agreement used
    pub one_time_prekey_id: u32,
}

/// Associated data binding both identities to every message
pub fn associated_data(initiator: &IdentityPublic, responder: &IdentityPublic) -> Vec<u8> {
    let mut ad = Vec::with_capacity(128);
    ad.extend_from_slice(&initiator.signing_key);
    ad.extend_from_slice(&initiator.dh_key);
    ad.extend_from_slice(&responder.signing_key);
    ad.extend_from_slice(&responder.dh_key);
    ad
}

fn shared_secret(parts: [&[u8; 32]; 4]) -> Zeroizing<[u8; 32]> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFF; 32]);
    for part in parts {
        ikm.extend_from_slice(part);
    }
    Zeroizing::new(kdf::derive(Some(&[0u8; 32][..]), &ikm, X3DH_INFO))
}

/// Initiator side. Verifies the bundle before deriving anything.
pub fn initiate(local: &IdentityKeyPair, bundle: &PreKeyBundle) -> Result<Agreement, CryptoError> {
    bundle.verify()?;
    let one_time = bundle
        .one_time_prekey
        .as_ref()
        .ok_or_else(|| CryptoError::InvalidKey("bundle has no one-time prekey".to_string()))?;

    let ephemeral = DhKeyPair::generate();
    let dh1 = local.dh().diffie_hellman(&bundle.signed_prekey);
    let dh2 = ephemeral.diffie_hellman(&bundle.identity.dh_key);
    let dh3 = ephemeral.diffie_hellman(&bundle.signed_prekey);
    let dh4 = ephemeral.diffie_hellman(&one_time.key);

    Ok(Agreement {
        shared_secret: shared_secret([&*dh1, &*dh2, &*dh3, &*dh4]),
        ephemeral_public: ephemeral.public_bytes(),
        one_time_prekey_id: one_time.id,
    })
}

/// Responder side
pub fn respond(
    local: &IdentityKeyPair,
    signed_prekey: &DhKeyPair,
    one_time_prekey: &DhKeyPair,
    remote_identity: &IdentityPublic,
    ephemeral_public: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let dh1 = signed_prekey.diffie_hellman(&remote_identity.dh_key);
    let dh2 = local.dh().diffie_hellman(ephemeral_public);
    let dh3 = signed_prekey.diffie_hellman(ephemeral_public);
    let dh4 = one_time_prekey.diffie_hellman(ephemeral_public);
    shared_secret([&*dh1, &*dh2, &*dh3, &*dh4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OneTimePreKeyPublic;

    #[test]
    fn test_both_sides_agree() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let spk = DhKeyPair::generate();
        let opk = DhKeyPair::generate();

        let bundle = PreKeyBundle {
            identity: bob.public(),
            signed_prekey_id: 1,
            signed_prekey: spk.public_bytes(),
            signed_prekey_signature: bob.sign(&spk.public_bytes()),
            one_time_prekey: Some(OneTimePreKeyPublic {
                id: 7,
                key: opk.public_bytes(),
            }),
        };

        let agreement = initiate(&alice, &bundle).unwrap();
        let responder = respond(&bob, &spk, &opk, &alice.public(), &agreement.ephemeral_public);

        assert_eq!(*agreement.shared_secret, *responder);
        assert_eq!(agreement.one_time_prekey_id, 7);
    }

    #[test]
    fn test_forged_bundle_rejected() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let mallory = IdentityKeyPair::generate().unwrap();
        let spk = DhKeyPair::generate();

        let bundle = PreKeyBundle {
            identity: bob.public(),
            signed_prekey_id: 1,
            signed_prekey: spk.public_bytes(),
            signed_prekey_signature: mallory.sign(&spk.public_bytes()),
            one_time_prekey: Some(OneTimePreKeyPublic {
                id: 1,
                key: DhKeyPair::generate().public_bytes(),
            }),
        };

        assert!(matches!(
            initiate(&alice, &bundle),
            Err(CryptoError::BadSignature)
        ));
    }
}
