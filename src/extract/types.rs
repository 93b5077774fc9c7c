//! Mapping from source type tags to extract column types.

use super::{ExtractType, SourceType};

/// Map a source column type to the extract column type that stores it.
///
/// Total: tags with no dedicated extract type fall back to
/// [`ExtractType::UnicodeString`].
pub fn map_type(source_type: &SourceType) -> ExtractType {
    match source_type {
        SourceType::Boolean => ExtractType::Boolean,
        SourceType::Integer => ExtractType::Integer,
        SourceType::Float | SourceType::Decimal => ExtractType::Double,
        SourceType::Text => ExtractType::UnicodeString,
        SourceType::Bytes => ExtractType::CharString,
        SourceType::Date => ExtractType::Date,
        SourceType::Timestamp => ExtractType::DateTime,
        SourceType::Interval => ExtractType::Duration,
        SourceType::Time | SourceType::Other(_) => ExtractType::UnicodeString,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types() {
        let cases = [
            (SourceType::Boolean, ExtractType::Boolean),
            (SourceType::Integer, ExtractType::Integer),
            (SourceType::Float, ExtractType::Double),
            (SourceType::Decimal, ExtractType::Double),
            (SourceType::Text, ExtractType::UnicodeString),
            (SourceType::Bytes, ExtractType::CharString),
            (SourceType::Date, ExtractType::Date),
            (SourceType::Timestamp, ExtractType::DateTime),
            (SourceType::Interval, ExtractType::Duration),
        ];

        for (source, expected) in cases {
            assert_eq!(map_type(&source), expected, "Failed for {:?}", source);
        }
    }

    #[test]
    fn test_unknown_types_fall_back_to_text() {
        assert_eq!(
            map_type(&SourceType::Other("Struct<a: Int32>".to_string())),
            ExtractType::UnicodeString
        );
        assert_eq!(map_type(&SourceType::Other(String::new())), ExtractType::UnicodeString);
        assert_eq!(map_type(&SourceType::Time), ExtractType::UnicodeString);
    }
}
