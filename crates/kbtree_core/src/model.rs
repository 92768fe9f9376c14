//! Wire records for the knowledge-base API.
//!
//! The same types deserialize from the JSON and the CSV wire formats. CSV
//! cells arrive as coerced JSON scalars (see [`crate::source`]), so string
//! fields accept numbers and nulls and list fields accept JSON arrays,
//! JSON-encoded strings or comma-separated strings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub codename: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub url: Option<String>,
}

/// A question's reference to one of its categories. The API sends either a
/// full category object or a bare id.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(from = "CategoryRefRepr")]
pub struct CategoryRef {
    pub id: i64,
    pub codename: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CategoryRefRepr {
    Id(i64),
    Object {
        id: i64,
        #[serde(default, deserialize_with = "lenient_opt_string")]
        codename: Option<String>,
    },
}

impl From<CategoryRefRepr> for CategoryRef {
    fn from(value: CategoryRefRepr) -> Self {
        match value {
            CategoryRefRepr::Id(id) => Self { id, codename: None },
            CategoryRefRepr::Object { id, codename } => Self { id, codename },
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub codename: String,
    #[serde(default)]
    pub accessibility: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_published: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "list_field")]
    pub categories: Vec<CategoryRef>,
    #[serde(default, deserialize_with = "list_field")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Internal,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "Internal",
            Self::Public => "External",
        }
    }
}

impl Question {
    /// The category that decides where the question lives on disk.
    pub fn primary_category(&self) -> Option<&CategoryRef> {
        self.categories.first()
    }

    pub fn visibility(&self) -> Option<Visibility> {
        match self.accessibility {
            Some(0) => Some(Visibility::Internal),
            Some(1) => Some(Visibility::Public),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub id: i64,
    pub question_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub body: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    })
}

fn list_field<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value).map_err(serde::de::Error::custom),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            if trimmed.starts_with('[') {
                return serde_json::from_str(trimmed).map_err(serde::de::Error::custom);
            }
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(list_item)
                .collect::<Result<Vec<T>, _>>()
                .map_err(serde::de::Error::custom)
        }
        Value::Number(number) => list_item(&number.to_string())
            .map(|item| vec![item])
            .map_err(serde::de::Error::custom),
        other => serde_json::from_value(Value::Array(vec![other]))
            .map_err(serde::de::Error::custom),
    }
}

fn list_item<T: DeserializeOwned>(piece: &str) -> Result<T, serde_json::Error> {
    if let Ok(number) = piece.parse::<i64>()
        && let Ok(item) = serde_json::from_value(Value::from(number))
    {
        return Ok(item);
    }
    serde_json::from_value(Value::String(piece.to_string()))
}
