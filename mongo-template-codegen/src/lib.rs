//! Procedural macros for mongo-template.
//!
//! # Macros
//!
//! - [`Reference`] - Derive the database/collection a record type lives in
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(mongo_template::Reference, serde::Serialize, serde::Deserialize)]
//! #[reference(database = "shop", collection = "orders")]
//! struct Order {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     id: Option<bson::oid::ObjectId>,
//!     total: i64,
//! }
//! ```

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod reference;

/// Derive macro binding a record type to a database and collection.
///
/// # Attributes
///
/// The `reference` attribute may appear on the struct or on any of its
/// fields; each key may only be given once.
///
/// - `#[reference(database = "name")]` - Target database
/// - `#[reference(collection = "name")]` - Target collection
/// - `#[reference(crate = "path")]` - Path to the `mongo_template` crate when
///   it is re-exported under another name
///
/// A missing `database` or `collection` is not a compile error: the
/// generated impl reports `None` and the template rejects the type with a
/// configuration error at call time.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(mongo_template::Reference)]
/// struct AuditEntry {
///     #[reference(database = "audit", collection = "entries")]
///     id: Option<bson::oid::ObjectId>,
///     message: String,
/// }
/// ```
#[proc_macro_derive(Reference, attributes(reference))]
pub fn derive_reference(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match reference::derive_reference_impl(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
