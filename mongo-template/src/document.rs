//! Document conversion utilities.

use bson::{Bson, Document};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{MongoError, MongoResult};

/// Convert a struct to a BSON document.
pub fn to_document<T: Serialize>(value: &T) -> MongoResult<Document> {
    Ok(bson::to_document(value)?)
}

/// Convert a BSON document to a struct.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> MongoResult<T> {
    Ok(bson::from_document(doc)?)
}

/// Whether every field of `doc` holds a zero value.
///
/// A document with no fields is zero.
pub fn is_zero_document(doc: &Document) -> bool {
    doc.values().all(is_zero_value)
}

/// Whether `value` is the zero value of its type: null, `false`, `0`, an
/// empty string, or an empty array or document (recursively).
pub fn is_zero_value(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => true,
        Bson::Boolean(b) => !b,
        Bson::Int32(n) => *n == 0,
        Bson::Int64(n) => *n == 0,
        Bson::Double(n) => *n == 0.0,
        Bson::String(s) => s.is_empty(),
        Bson::Array(items) => items.is_empty(),
        Bson::Document(doc) => is_zero_document(doc),
        _ => false,
    }
}

/// Serialize `value` and reject it when it carries no data.
pub(crate) fn to_non_zero_document<T: Serialize>(value: &T) -> MongoResult<Document> {
    let doc = to_document(value)?;
    if is_zero_document(&doc) {
        return Err(MongoError::EmptyDocument);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct User {
        #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<ObjectId>,
        name: String,
        age: i32,
        tags: Vec<String>,
        nickname: Option<String>,
    }

    #[test]
    fn test_to_and_from_document() {
        let user = User {
            name: "Bob".to_string(),
            age: 25,
            ..Default::default()
        };

        let doc = to_document(&user).unwrap();
        assert_eq!(doc.get_str("name").unwrap(), "Bob");
        assert_eq!(doc.get_i32("age").unwrap(), 25);

        let back: User = from_document(doc).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_from_document_type_mismatch() {
        let err = from_document::<User>(doc! { "name": 5 }).unwrap_err();
        assert!(matches!(err, MongoError::BsonDe(_)));
    }

    #[test]
    fn test_to_document_rejects_non_document_values() {
        let err = to_document(&5_i32).unwrap_err();
        assert!(matches!(err, MongoError::Bson(_)));
    }

    #[test]
    fn test_zero_documents() {
        assert!(is_zero_document(&doc! {}));
        assert!(is_zero_document(&to_document(&User::default()).unwrap()));
        assert!(is_zero_document(&doc! { "nested": { "flag": false, "list": [] } }));

        assert!(!is_zero_document(&doc! { "age": 1 }));
        assert!(!is_zero_document(&doc! { "_id": ObjectId::new() }));
    }

    #[test]
    fn test_to_non_zero_document() {
        assert!(matches!(
            to_non_zero_document(&User::default()),
            Err(MongoError::EmptyDocument)
        ));

        let user = User {
            nickname: Some("b".into()),
            ..Default::default()
        };
        assert!(to_non_zero_document(&user).is_ok());
    }
}
