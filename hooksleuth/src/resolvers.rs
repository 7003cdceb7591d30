//! Declarative tables of named addresses resolved by signature.
//!
//! Subsystems declare every address they need up front and resolve the
//! whole table in one sweep over the module at construction time:
//!
//! ```
//! hooksleuth::address_table! {
//!     /// Addresses the chat interceptor needs.
//!     pub struct ChatAddresses {
//!         print_message: "E8 ?? ?? ?? ?? 48 8B 5C 24 58",
//!         opt format_preview: "40 53 48 83 EC 20 8B DA",
//!     }
//! }
//! ```
//!
//! A required entry that does not resolve fails the whole table with that
//! entry's name, so the subsystem never constructs and a null pointer is
//! never called. `opt` entries resolve to `None` and the owning subsystem
//! disables the dependent feature instead of hooking a null target.

use thiserror::Error;

use crate::scanner::ScanError;

/// One name to address binding out of a resolved table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub name: &'static str,
    /// Absolute address, or `None` for an unresolved optional entry.
    pub address: Option<usize>,
}

/// Failure to resolve an address table.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A required entry's signature did not resolve against this host
    /// build.
    #[error("required address {name:?} did not resolve (signature {signature:?})")]
    Missing {
        name: &'static str,
        signature: &'static str,
    },
    /// The underlying scan failed outright (malformed signature).
    #[error(transparent)]
    Scan(#[from] ScanError),
}

#[doc(hidden)]
pub fn __log_entry(name: &'static str, address: Option<usize>, required: bool) {
    match address {
        Some(address) => tracing::debug!("address {name:?} resolved to {address:#x}"),
        None if required => tracing::error!("required address {name:?} not found"),
        None => tracing::info!("optional address {name:?} not found"),
    }
}

/// Generates a named-address table: a struct with one `usize` field per
/// required entry and one `Option<usize>` per `opt` entry, a `resolve`
/// constructor that scans every signature in one batch, and an `entries`
/// accessor for dynamic iteration. See the [module docs](self).
#[macro_export]
macro_rules! address_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident { $($fields:tt)* }
    ) => {
        $crate::address_table!(@munch [$(#[$meta])*] [$vis] $name [] $($fields)*);
    };

    (@munch [$($meta:tt)*] [$vis:vis] $name:ident [$($done:tt)*]
        opt $field:ident : $sig:literal $(, $($rest:tt)*)?
    ) => {
        $crate::address_table!(@munch [$($meta)*] [$vis] $name
            [$($done)* (opt $field $sig)] $($($rest)*)?);
    };
    (@munch [$($meta:tt)*] [$vis:vis] $name:ident [$($done:tt)*]
        $field:ident : $sig:literal $(, $($rest:tt)*)?
    ) => {
        $crate::address_table!(@munch [$($meta)*] [$vis] $name
            [$($done)* (req $field $sig)] $($($rest)*)?);
    };

    (@munch [$($meta:tt)*] [$vis:vis] $name:ident
        [$(($kind:ident $field:ident $sig:literal))*]
    ) => {
        $($meta)*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $name {
            $( pub $field: $crate::__address_field_ty!($kind), )*
        }

        impl $name {
            /// Entry names and signatures, in declaration order.
            $vis const SIGNATURES: &'static [(&'static str, &'static str)] = &[
                $( (stringify!($field), $sig), )*
            ];

            /// Resolves every entry in one sweep over the scanner's
            /// region.
            $vis fn resolve(
                scanner: &$crate::scanner::SigScanner,
            ) -> ::core::result::Result<Self, $crate::resolvers::ResolveError> {
                let signatures: ::std::vec::Vec<&str> =
                    Self::SIGNATURES.iter().map(|(_, s)| *s).collect();
                let mut found = scanner.scan_batch(&signatures)?.into_iter();
                ::core::result::Result::Ok(Self {
                    $( $field: {
                        let address = found.next().unwrap();
                        $crate::resolvers::__log_entry(
                            stringify!($field),
                            address,
                            $crate::__address_field_required!($kind),
                        );
                        $crate::__address_field_bind!($kind, stringify!($field), $sig, address)
                    }, )*
                })
            }

            /// The table as dynamic name/address bindings.
            $vis fn entries(&self) -> ::std::vec::Vec<$crate::resolvers::ResolvedAddress> {
                ::std::vec![
                    $( $crate::resolvers::ResolvedAddress {
                        name: stringify!($field),
                        address: $crate::__address_field_get!($kind, self.$field),
                    }, )*
                ]
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __address_field_ty {
    (req) => { usize };
    (opt) => { ::core::option::Option<usize> };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __address_field_required {
    (req) => {
        true
    };
    (opt) => {
        false
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __address_field_bind {
    (req, $name:expr, $sig:expr, $address:expr) => {
        match $address {
            ::core::option::Option::Some(address) => address,
            ::core::option::Option::None => {
                return ::core::result::Result::Err(
                    $crate::resolvers::ResolveError::Missing {
                        name: $name,
                        signature: $sig,
                    },
                )
            }
        }
    };
    (opt, $name:expr, $sig:expr, $address:expr) => {
        $address
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __address_field_get {
    (req, $value:expr) => {
        ::core::option::Option::Some($value)
    };
    (opt, $value:expr) => {
        $value
    };
}
