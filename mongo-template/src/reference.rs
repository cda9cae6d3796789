//! Binding record types to a database and collection.

use crate::driver::Namespace;
use crate::error::{MongoError, MongoResult};

/// A record type that knows where it is stored.
///
/// Usually derived:
///
/// ```rust,ignore
/// #[derive(Reference, Serialize, Deserialize)]
/// #[reference(database = "shop", collection = "orders")]
/// struct Order {
///     total: i64,
/// }
/// ```
///
/// Both methods default to `None`; a type that leaves either unset is
/// rejected with [`MongoError::MissingDatabase`] or
/// [`MongoError::MissingCollection`] before any driver call is made.
pub trait Reference {
    /// Database holding the type's collection.
    fn database_name() -> Option<&'static str> {
        None
    }

    /// Collection holding documents of this type.
    fn collection_name() -> Option<&'static str> {
        None
    }
}

/// Resolve the namespace of `T`, falling back to `default_database` when the
/// type names no database.
pub fn resolve_namespace<T: Reference>(default_database: Option<&str>) -> MongoResult<Namespace> {
    let type_name = std::any::type_name::<T>();

    let database = T::database_name()
        .filter(|name| !name.is_empty())
        .or(default_database.filter(|name| !name.is_empty()))
        .ok_or(MongoError::MissingDatabase(type_name))?;
    let collection = T::collection_name()
        .filter(|name| !name.is_empty())
        .ok_or(MongoError::MissingCollection(type_name))?;

    Ok(Namespace::new(database, collection))
}
