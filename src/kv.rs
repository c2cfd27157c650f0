use num::PrimInt;
use std::fmt::Debug;
use trait_set::trait_set;

// Until `trait_alias` is stabilized, we have to use a macro
trait_set! {
    /// General value type, thread-safe and stored by copy
    pub trait Value = Send + Sync + Debug + Copy + 'static;

    /// General key type: a thread-safe primitive integer the linear models
    /// can project into `f64`
    pub trait Key = Value + PrimInt;
}

/// Cast a key into the `f64` domain the linear models work in.
#[inline]
pub(crate) fn to_f64<K: Key>(key: K) -> f64 {
    // PrimInt guarantees the cast exists; it is lossy above 2^53 which the
    // model tolerates the same way it tolerates any other fit error.
    num::cast::<K, f64>(key).unwrap()
}
