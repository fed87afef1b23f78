use std::sync::Mutex;

use once_cell::sync::Lazy;

// All random values in this crate come from this one generator. Access is
// serialized by the mutex; individual draws are cheap.
static RNG: Lazy<Mutex<fastrand::Rng>> = Lazy::new(|| Mutex::new(fastrand::Rng::new()));

/// Non-cryptographic random number generator using fastrand.
pub(crate) struct NonCryptographicRng;

impl NonCryptographicRng {
    #[inline(always)]
    pub fn u8() -> u8 {
        RNG.lock().unwrap().u8(..)
    }

    #[inline(always)]
    pub fn u16() -> u16 {
        RNG.lock().unwrap().u16(..)
    }

    #[inline(always)]
    pub fn u32() -> u32 {
        RNG.lock().unwrap().u32(..)
    }
}
