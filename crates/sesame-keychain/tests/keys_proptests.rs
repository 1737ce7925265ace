#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for master key wrapping.
//!
//! Verifies the invariant:
//! `∀ K, P: derive_and_validate(rewrap_master_key(K, P), P) == K`

use proptest::prelude::*;
use sesame_keychain::keys::{
    create_master_key, derive_and_validate, read_key_entries, rewrap_master_key,
    write_key_entries, MasterKey, SecurityLevel,
};
use sesame_keychain::{KeychainError, SecretBuffer, MIN_PBKDF2_ITERATIONS};

fn level_strategy() -> impl Strategy<Value = SecurityLevel> {
    prop_oneof![Just(SecurityLevel::Sl3), Just(SecurityLevel::Sl5)]
}

fn passphrase_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..48)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Rewrapping any key under any passphrase recovers the same key.
    #[test]
    fn rewrap_then_unlock_recovers_key(
        raw in proptest::collection::vec(any::<u8>(), 1..256),
        passphrase in passphrase_strategy(),
        level in level_strategy(),
    ) {
        let master = MasterKey::new("0123456789ABCDEF0123456789ABCDEF".into(), SecretBuffer::from_vec(raw.clone()));
        let entry = rewrap_master_key(&master, level, &passphrase, MIN_PBKDF2_ITERATIONS)
            .expect("rewrap should succeed");
        let unlocked = derive_and_validate(&entry, &passphrase)
            .expect("unlock should succeed with the same passphrase");
        prop_assert_eq!(unlocked.expose(), raw.as_slice());
        prop_assert_eq!(unlocked.identifier, master.identifier);
    }

    /// Unlocking with a different passphrase always fails with
    /// `Authentication`.
    #[test]
    fn wrong_passphrase_always_fails(
        passphrase in passphrase_strategy(),
        wrong in passphrase_strategy(),
    ) {
        prop_assume!(passphrase != wrong);
        let (entry, _) = create_master_key(&passphrase, SecurityLevel::Sl5, MIN_PBKDF2_ITERATIONS)
            .expect("create should succeed");
        let result = derive_and_validate(&entry, &wrong);
        prop_assert!(matches!(result, Err(KeychainError::Authentication)));
    }

    /// The key table codec preserves every entry.
    #[test]
    fn key_table_roundtrip(level in level_strategy(), iterations in 1000u32..5000) {
        let (entry, master) = create_master_key(b"pw", level, iterations)
            .expect("create should succeed");
        let bytes = write_key_entries(std::slice::from_ref(&entry)).expect("write");
        let parsed = read_key_entries(&bytes).expect("read");
        prop_assert_eq!(&parsed, &vec![entry]);

        let unlocked = derive_and_validate(&parsed[0], b"pw").expect("unlock");
        prop_assert_eq!(unlocked.expose(), master.expose());
    }
}

/// Password change keeps the key: every payload encrypted before stays
/// decryptable after.
#[test]
fn password_change_keeps_master_key() {
    let (old_entry, master) = create_master_key(b"old", SecurityLevel::Sl5, MIN_PBKDF2_ITERATIONS)
        .expect("create should succeed");
    let new_entry = rewrap_master_key(&master, old_entry.level, b"new", MIN_PBKDF2_ITERATIONS)
        .expect("rewrap should succeed");

    assert_eq!(new_entry.identifier, old_entry.identifier);
    assert!(derive_and_validate(&new_entry, b"old").is_err());
    let unlocked = derive_and_validate(&new_entry, b"new").expect("unlock with new");
    assert_eq!(unlocked.expose(), master.expose());
}
