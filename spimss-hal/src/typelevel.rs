//! Module supporting type-level programming
//!
//! The word types accepted by the engine form a closed set: downstream crates
//! can name [`Word`](crate::Word) but not implement it.

mod private {
    /// Super trait used to mark traits with an exhaustive set of
    /// implementations
    pub trait Sealed {}
}

pub(crate) use private::Sealed;

impl Sealed for u8 {}
impl Sealed for u16 {}
