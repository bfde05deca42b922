//! Accessor macros for persisted little-endian headers.
//!
//! On-disk structs store integers as `zerocopy::little_endian` wrappers so
//! files are byte-compatible across hosts. `le_accessors!` generates the
//! native-typed getter/setter pairs so the rest of the crate never touches
//! the wrapper types directly.

/// Generates `field()` / `set_field()` pairs for `little_endian::{U16,U32,U64}`
/// struct fields.
///
/// ```ignore
/// impl PersistedPageHeader {
///     le_accessors! {
///         self_id: u64,
///         flags: u32,
///     }
/// }
/// ```
#[macro_export]
macro_rules! le_accessors {
    ($($field:ident : $native:ident),* $(,)?) => {
        $( $crate::le_accessors!(@one $field, $native); )*
    };
    (@one $field:ident, u16) => {
        $crate::le_accessors!(@gen $field, u16, U16);
    };
    (@one $field:ident, u32) => {
        $crate::le_accessors!(@gen $field, u32, U32);
    };
    (@one $field:ident, u64) => {
        $crate::le_accessors!(@gen $field, u64, U64);
    };
    (@gen $field:ident, $native:ty, $wrapper:ident) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> $native {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: $native) {
                self.$field = ::zerocopy::little_endian::$wrapper::new(val);
            }
        }
    };
}
