mod mlock_verification;
mod secret_leakage;
