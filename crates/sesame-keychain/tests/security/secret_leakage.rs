//! Secret values must not leak through formatting or error detail.

use sesame_keychain::{
    create_master_key, derive_and_validate, CryptoParams, ItemContent, KeychainError,
    SaltedBlob, SecurityLevel, MIN_PBKDF2_ITERATIONS,
};

const PASSPHRASE: &[u8] = b"correct horse battery staple";

#[test]
fn master_key_debug_contains_no_key_bytes() {
    let (_, master) = create_master_key(PASSPHRASE, SecurityLevel::Sl5, MIN_PBKDF2_ITERATIONS)
        .expect("create_master_key should succeed");
    let debug = format!("{master:?}");
    let hex: String = master.expose()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    assert!(!debug.contains(&hex));
    assert!(!debug.contains(&format!("{:?}", &master.expose()[..4])));
}

#[test]
fn key_entry_debug_contains_no_passphrase() {
    let (entry, _) = create_master_key(PASSPHRASE, SecurityLevel::Sl5, MIN_PBKDF2_ITERATIONS)
        .expect("create_master_key should succeed");
    let debug = format!("{entry:?}");
    assert!(!debug.contains("correct horse"));
}

#[test]
fn item_content_debug_contains_no_values() {
    let mut content = ItemContent::default();
    content.set_account("alice@example.org");
    content.set_password("hunter2hunter2");
    content.notes = "recovery codes: 1111 2222".into();
    let debug = format!("{content:?}");
    assert!(!debug.contains("alice@example.org"));
    assert!(!debug.contains("hunter2hunter2"));
    assert!(!debug.contains("1111"));
}

#[test]
fn wrong_passphrase_and_corrupt_entry_fail_identically() {
    let (entry, _) = create_master_key(PASSPHRASE, SecurityLevel::Sl5, MIN_PBKDF2_ITERATIONS)
        .expect("create_master_key should succeed");

    let wrong = derive_and_validate(&entry, b"not the passphrase")
        .expect_err("wrong passphrase must fail");

    let mut corrupt = entry;
    corrupt.validation = SaltedBlob::seal(b"other key", b"other key", &CryptoParams::for_item())
        .expect("seal should succeed");
    let corrupted = derive_and_validate(&corrupt, PASSPHRASE).expect_err("corrupt entry must fail");

    assert!(matches!(wrong, KeychainError::Authentication));
    assert!(matches!(corrupted, KeychainError::Authentication));
    assert_eq!(wrong.to_string(), corrupted.to_string());
}
