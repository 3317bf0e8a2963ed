//! Typed feed records and their mapping from raw store rows.
//!
//! Stores hand out rows of loosely typed [`RawValue`]s, possibly wrapped into optionals. Everything past
//! [`TryFrom<&Row>`] works with the structs of this module only.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;

/// A single column value as the store returns it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Uint64(u64),
    Int64(i64),
    Utf8(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Optional(Box<RawValue>),
}

impl RawValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Uint64(_) => "uint64",
            Self::Int64(_) => "int64",
            Self::Utf8(_) => "utf8",
            Self::Timestamp(_) => "timestamp",
            Self::Optional(_) => "optional",
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<u64> for RawValue {
    fn from(value: u64) -> Self {
        Self::Uint64(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value.timestamp_micros())
    }
}

impl<T> From<Option<T>> for RawValue
where
    T: Into<RawValue>,
{
    fn from(value: Option<T>) -> Self {
        Self::Optional(Box::new(value.map_or(Self::Null, Into::into)))
    }
}

/// One result row, columns by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, RawValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<RawValue>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn raw(&self, column: &str) -> Option<&RawValue> {
        self.columns.get(column)
    }

    // Missing columns, nulls and empty optionals all come out as None.
    fn value(&self, column: &str) -> Option<&RawValue> {
        let mut value = self.columns.get(column)?;
        while let RawValue::Optional(inner) = value {
            value = inner;
        }
        (*value != RawValue::Null).then_some(value)
    }

    fn malformed(column: &str, value: &RawValue, expected: &str) -> StoreError {
        StoreError::Malformed {
            field:  column.to_string(),
            reason: format!("expected {expected}, got {}", value.kind()),
        }
    }

    pub fn opt_string(&self, column: &str) -> Result<Option<String>, StoreError> {
        match self.value(column) {
            None => Ok(None),
            Some(RawValue::Utf8(s)) => Ok(Some(s.clone())),
            // Ids are strings, but some tables were created with numeric ones.
            Some(RawValue::Uint64(n)) => Ok(Some(n.to_string())),
            Some(RawValue::Int64(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(Self::malformed(column, other, "text")),
        }
    }

    pub fn string(&self, column: &str) -> Result<String, StoreError> {
        self.opt_string(column)?
            .ok_or_else(|| StoreError::MissingField(column.to_string()))
    }

    pub fn opt_u64(&self, column: &str) -> Result<Option<u64>, StoreError> {
        match self.value(column) {
            None => Ok(None),
            Some(RawValue::Uint64(n)) => Ok(Some(*n)),
            Some(RawValue::Int64(n)) => u64::try_from(*n).map(Some).map_err(|_| StoreError::Malformed {
                field:  column.to_string(),
                reason: format!("negative value {n}"),
            }),
            Some(other) => Err(Self::malformed(column, other, "an unsigned integer")),
        }
    }

    /// Counters default to zero when the column is absent or null.
    pub fn count(&self, column: &str) -> Result<u64, StoreError> {
        Ok(self.opt_u64(column)?.unwrap_or(0))
    }

    pub fn flag(&self, column: &str) -> Result<bool, StoreError> {
        match self.value(column) {
            None => Ok(false),
            Some(RawValue::Bool(b)) => Ok(*b),
            Some(other) => Err(Self::malformed(column, other, "a boolean")),
        }
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let micros = match self.value(column) {
            None => return Ok(None),
            Some(RawValue::Timestamp(us)) | Some(RawValue::Int64(us)) => *us,
            Some(RawValue::Uint64(us)) => i64::try_from(*us).map_err(|_| StoreError::Malformed {
                field:  column.to_string(),
                reason: format!("timestamp {us} is out of range"),
            })?,
            Some(RawValue::Utf8(s)) => {
                return DateTime::parse_from_rfc3339(s)
                    .map(|dt| Some(dt.with_timezone(&Utc)))
                    .map_err(|err| StoreError::Malformed {
                        field:  column.to_string(),
                        reason: err.to_string(),
                    });
            }
            Some(other) => return Err(Self::malformed(column, other, "a timestamp")),
        };

        DateTime::from_timestamp_micros(micros)
            .map(Some)
            .ok_or_else(|| StoreError::Malformed {
                field:  column.to_string(),
                reason: format!("timestamp {micros} is out of range"),
            })
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, StoreError> {
        self.opt_timestamp(column)?
            .ok_or_else(|| StoreError::MissingField(column.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct News {
    pub id:              String,
    pub title:           String,
    pub content:         String,
    pub author_id:       String,
    pub author_name:     Option<String>,
    pub hashtags:        Vec<String>,
    pub likes_count:     u64,
    pub bookmarks_count: u64,
    pub reposts_count:   u64,
    pub comments_count:  u64,
    pub is_repost:       bool,
    pub created_at:      DateTime<Utc>,
    pub updated_at:      Option<DateTime<Utc>>,
}

impl TryFrom<&Row> for News {
    type Error = StoreError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        // Hashtags are kept as a JSON array in a text column; anything unparsable means "no tags".
        let hashtags = row
            .opt_string("hashtags")?
            .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
            .unwrap_or_default();

        Ok(Self {
            id: row.string("id")?,
            title: row.string("title")?,
            content: row.opt_string("content")?.unwrap_or_default(),
            author_id: row.string("author_id")?,
            author_name: row.opt_string("author_name")?,
            hashtags,
            likes_count: row.count("likes_count")?,
            bookmarks_count: row.count("bookmarks_count")?,
            reposts_count: row.count("reposts_count")?,
            comments_count: row.count("comments_count")?,
            is_repost: row.flag("is_repost")?,
            created_at: row.timestamp("created_at")?,
            updated_at: row.opt_timestamp("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id:         String,
    pub name:       String,
    pub email:      Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&Row> for User {
    type Error = StoreError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id:         row.string("id")?,
            name:       row.string("name")?,
            email:      row.opt_string("email")?,
            avatar_url: row.opt_string("avatar_url")?,
            created_at: row.timestamp("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id:         String,
    pub news_id:    String,
    pub user_id:    String,
    pub user_name:  Option<String>,
    pub text:       String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&Row> for Comment {
    type Error = StoreError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id:         row.string("id")?,
            news_id:    row.string("news_id")?,
            user_id:    row.string("user_id")?,
            user_name:  row.opt_string("user_name")?,
            text:       row.string("text")?,
            created_at: row.timestamp("created_at")?,
        })
    }
}

/// One line of the author leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorStats {
    pub author_id:   String,
    pub author_name: Option<String>,
    pub news_count:  u64,
    pub total_likes: u64,
}

impl TryFrom<&Row> for AuthorStats {
    type Error = StoreError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            author_id:   row.string("author_id")?,
            author_name: row.opt_string("author_name")?,
            news_count:  row.count("news_count")?,
            total_likes: row.count("total_likes")?,
        })
    }
}

/// A news item to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNews {
    pub title:     String,
    pub content:   String,
    #[serde(default)]
    pub hashtags:  Vec<String>,
    #[serde(default)]
    pub is_repost: bool,
}

impl NewNews {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// An edit of a published news item. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsUpdate {
    pub title:    Option<String>,
    pub content:  Option<String>,
    pub hashtags: Option<Vec<String>>,
}

impl NewsUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.hashtags.is_none()
    }
}

/// Map every row, failing on the first malformed one.
pub fn map_rows<'a, T>(rows: impl IntoIterator<Item = &'a Row>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<&'a Row, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn news_row() -> Row {
        Row::new()
            .with("id", "n1")
            .with("title", "Derby tonight")
            .with("author_id", RawValue::Optional(Box::new(RawValue::Uint64(17))))
            .with("author_name", None::<String>)
            .with("hashtags", r#"["football","derby"]"#)
            .with("likes_count", RawValue::Int64(3))
            .with("comments_count", RawValue::Null)
            .with("created_at", RawValue::Uint64(1_700_000_000_000_000))
    }

    #[test]
    fn news_from_raw_row() {
        let news = News::try_from(&news_row()).unwrap();
        assert_eq!(news.id, "n1");
        assert_eq!(news.author_id, "17");
        assert_eq!(news.author_name, None);
        assert_eq!(news.hashtags, vec!["football", "derby"]);
        assert_eq!(news.likes_count, 3);
        assert_eq!(news.comments_count, 0);
        assert_eq!(news.content, "");
        assert!(!news.is_repost);
        assert_eq!(news.created_at.timestamp(), 1_700_000_000);
        assert_eq!(news.updated_at, None);
    }

    #[test]
    fn broken_hashtags_mean_no_tags() {
        let row = news_row().with("hashtags", "football, derby");
        assert!(News::try_from(&row).unwrap().hashtags.is_empty());
    }

    #[test]
    fn missing_and_malformed_fields() {
        let row = Row::new().with("id", "u1").with("created_at", RawValue::Timestamp(0));
        assert_eq!(User::try_from(&row), Err(StoreError::MissingField("name".into())));

        let row = news_row().with("likes_count", RawValue::Int64(-1));
        assert!(matches!(
            News::try_from(&row),
            Err(StoreError::Malformed { field, .. }) if field == "likes_count"
        ));

        let row = news_row().with("title", RawValue::Bool(true));
        assert!(matches!(News::try_from(&row), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn rfc3339_timestamps() {
        let row = Row::new()
            .with("id", "c1")
            .with("news_id", "n1")
            .with("user_id", "u1")
            .with("text", "nice")
            .with("created_at", "2024-03-01T12:00:00Z");
        let comment = Comment::try_from(&row).unwrap();
        assert_eq!(comment.created_at.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn news_input_defaults() {
        let news: NewNews = serde_json::from_str(r#"{ "title": "Derby", "content": "Tonight" }"#).unwrap();
        assert_eq!(news, NewNews::new("Derby", "Tonight"));
        assert!(news.hashtags.is_empty());

        let update: NewsUpdate = serde_json::from_str(r#"{ "hashtags": ["derby"] }"#).unwrap();
        assert!(!update.is_empty());
        assert_eq!(update.title, None);
        assert!(NewsUpdate::default().is_empty());
    }

    #[test]
    fn map_rows_stops_at_first_error() {
        let good = Row::new().with("author_id", "a").with("news_count", 2u64);
        let bad = Row::new().with("news_count", 1u64);
        let mapped = map_rows::<AuthorStats>([&good]).unwrap();
        assert_eq!(mapped[0].news_count, 2);
        assert!(map_rows::<AuthorStats>([&good, &bad]).is_err());
    }
}
