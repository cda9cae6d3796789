//! Per-operation options.
//!
//! Every template operation accepts any number of option values of its
//! option type (`None`, one value, or an array). They are merged
//! left-to-right with [`merge_options`]: a later `Some` field overrides an
//! earlier one, and a session flag set anywhere stays set.
//!
//! ```rust
//! use mongo_template::options::{FindOptions, merge_options};
//!
//! let base = FindOptions::new().limit(50).sort(bson::doc! { "created": -1 });
//! let call = FindOptions::new().limit(10).disable_auto_close_session();
//!
//! let merged = merge_options([base, call]);
//! assert_eq!(merged.limit, Some(10));
//! assert!(merged.sort.is_some());
//! assert!(merged.session.disable_auto_close_session);
//! ```
//!
//! Driver knobs are passed unmodified to the matching `mongodb` option type.

use std::time::Duration;

use bson::{Bson, Document};
use mongodb::options as driver;
use mongodb::options::{Collation, Hint};

/// How an operation interacts with the template's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Leave the session open after the operation; the caller closes it.
    pub disable_auto_close_session: bool,
    /// Commit even when the operation failed.
    pub disable_auto_rollback_session: bool,
    /// Commit and replace a session that is already open before running.
    pub force_recreate_session: bool,
}

impl SessionPolicy {
    fn merge(self, later: Self) -> Self {
        Self {
            disable_auto_close_session: self.disable_auto_close_session
                || later.disable_auto_close_session,
            disable_auto_rollback_session: self.disable_auto_rollback_session
                || later.disable_auto_rollback_session,
            force_recreate_session: self.force_recreate_session || later.force_recreate_session,
        }
    }
}

/// Option types that can be merged left-to-right.
pub trait MergeOptions: Default {
    /// Merge `later` on top of `self`.
    fn merge(self, later: Self) -> Self;
}

/// Merge option values left-to-right, starting from the defaults.
pub fn merge_options<O: MergeOptions>(options: impl IntoIterator<Item = O>) -> O {
    options.into_iter().fold(O::default(), O::merge)
}

macro_rules! operation_options {
    (@assign $options:ident, $value:expr, $field:ident) => {
        $options.$field = $value;
    };
    (@assign $options:ident, $value:expr, $field:ident as $driver_field:ident) => {
        $options.$driver_field = $value;
    };
    (
        $(#[$meta:meta])*
        $name:ident => $driver:ty {
            $(
                $(#[$field_meta:meta])*
                $field:ident $(as $driver_field:ident)?: $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            /// Session handling.
            pub session: SessionPolicy,
            $(
                $(#[$field_meta])*
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            /// Options with every field unset.
            pub fn new() -> Self {
                Self::default()
            }

            /// Leave the session open after the operation.
            pub fn disable_auto_close_session(mut self) -> Self {
                self.session.disable_auto_close_session = true;
                self
            }

            /// Commit even when the operation fails.
            pub fn disable_auto_rollback_session(mut self) -> Self {
                self.session.disable_auto_rollback_session = true;
                self
            }

            /// Commit any open session and start a fresh one first.
            pub fn force_recreate_session(mut self) -> Self {
                self.session.force_recreate_session = true;
                self
            }

            $(
                $(#[$field_meta])*
                pub fn $field(mut self, value: impl Into<$ty>) -> Self {
                    self.$field = Some(value.into());
                    self
                }
            )*

            /// The driver options this value translates to.
            pub fn to_driver(&self) -> $driver {
                let mut options = <$driver>::default();
                $(
                    operation_options!(
                        @assign options, self.$field.clone(), $field $(as $driver_field)?
                    );
                )*
                options
            }
        }

        impl MergeOptions for $name {
            fn merge(self, later: Self) -> Self {
                Self {
                    session: self.session.merge(later.session),
                    $(
                        $field: later.$field.or(self.$field),
                    )*
                }
            }
        }
    };
}

operation_options! {
    /// Options for `insert_one`.
    InsertOneOptions => driver::InsertOneOptions {
        /// Skip document validation.
        bypass_document_validation: bool,
        /// Value attached to the command in server logs and profiles.
        comment: Bson,
    }
}

operation_options! {
    /// Options for `insert_many`.
    ///
    /// Items are always all attempted; there is no `ordered` switch.
    InsertManyOptions => driver::InsertOneOptions {
        /// Skip document validation.
        bypass_document_validation: bool,
        /// Value attached to the command in server logs and profiles.
        comment: Bson,
    }
}

operation_options! {
    /// Options for `find_one`.
    FindOneOptions => driver::FindOneOptions {
        /// Fields to return.
        projection: Document,
        /// Sort order deciding which match is returned.
        sort: Document,
        /// Matches to skip.
        skip: u64,
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Server-side time limit.
        max_time: Duration,
        /// Value attached to the command in server logs and profiles.
        comment as comment_bson: Bson,
    }
}

operation_options! {
    /// Options for `find` and `find_page`.
    FindOptions => driver::FindOptions {
        /// Fields to return.
        projection: Document,
        /// Sort order.
        sort: Document,
        /// Matches to skip.
        skip: u64,
        /// Maximum number of documents.
        limit: i64,
        /// Cursor batch size.
        batch_size: u32,
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Server-side time limit.
        max_time: Duration,
        /// Value attached to the command in server logs and profiles.
        comment as comment_bson: Bson,
    }
}

operation_options! {
    /// Options for `update_one` and `update_many`.
    UpdateOptions => driver::UpdateOptions {
        /// Insert a document when nothing matches.
        upsert: bool,
        /// Filters selecting array elements to update.
        array_filters: Vec<Document>,
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Skip document validation.
        bypass_document_validation: bool,
        /// Value attached to the command in server logs and profiles.
        comment: Bson,
    }
}

operation_options! {
    /// Options for `delete_one` and `delete_many`.
    DeleteOptions => driver::DeleteOptions {
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Value attached to the command in server logs and profiles.
        comment: Bson,
    }
}

operation_options! {
    /// Options for `count_documents`.
    CountOptions => driver::CountOptions {
        /// Matches to skip.
        skip: u64,
        /// Maximum number counted.
        limit: u64,
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Server-side time limit.
        max_time: Duration,
        /// Value attached to the command in server logs and profiles.
        comment: Bson,
    }
}

operation_options! {
    /// Options for `aggregate`.
    AggregateOptions => driver::AggregateOptions {
        /// Allow stages to spill to disk.
        allow_disk_use: bool,
        /// Cursor batch size.
        batch_size: u32,
        /// Index hint.
        hint: Hint,
        /// Collation.
        collation: Collation,
        /// Server-side time limit.
        max_time: Duration,
        /// Value attached to the command in server logs and profiles.
        comment as comment_bson: Bson,
    }
}
