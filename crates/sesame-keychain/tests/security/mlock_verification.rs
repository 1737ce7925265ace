//! Unlocked key material sits in locked pages, and the process refuses to
//! dump core. Unix only.
//!
//! `mlock` may be refused under a low `RLIMIT_MEMLOCK` (containers, CI), so
//! page-locking is only checked when the buffer reports it succeeded.

use sesame_keychain::{
    create_master_key, derive_and_validate, disable_core_dumps, SecretBuffer, SecurityLevel,
    MASTER_KEY_LEN,
};

#[cfg(unix)]
#[test]
fn unlocked_master_key_is_page_locked_when_permitted() {
    let (entry, _) = create_master_key(b"pw", SecurityLevel::Sl5, 1000).expect("create");
    let unlocked = derive_and_validate(&entry, b"pw").expect("unlock");
    let (_, raw) = unlocked.into_parts();
    assert_eq!(raw.len(), MASTER_KEY_LEN);
    if !raw.is_mlocked() {
        eprintln!("mlock refused for master key; RLIMIT_MEMLOCK too low");
    }
}

#[cfg(target_os = "linux")]
#[test]
fn held_master_keys_show_up_in_vmlck() {
    let before = locked_kib();
    let keys: Vec<_> = (0..16)
        .map(|_| SecretBuffer::random(MASTER_KEY_LEN).expect("alloc"))
        .collect();

    if keys.iter().all(SecretBuffer::is_mlocked) {
        let after = locked_kib();
        assert!(after >= before, "VmLck went down: {before} kB -> {after} kB");
    } else {
        eprintln!("mlock refused; skipping VmLck check");
    }
}

#[cfg(target_os = "linux")]
fn locked_kib() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .expect("read /proc/self/status")
        .lines()
        .find_map(|line| line.strip_prefix("VmLck:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(unix)]
#[test]
fn core_dumps_are_disabled() {
    disable_core_dumps().expect("disable_core_dumps should succeed");

    let mut limit = libc::rlimit {
        rlim_cur: 1,
        rlim_max: 1,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_CORE, &raw mut limit) };
    assert_eq!(ret, 0, "getrlimit failed");
    assert_eq!((limit.rlim_cur, limit.rlim_max), (0, 0));
}
