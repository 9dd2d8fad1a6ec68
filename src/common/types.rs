/// A generic boxed error type.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// A convenient Result alias returning `AnyError`.
pub type AnyResult<T> = std::result::Result<T, AnyError>;

macro_rules! snowflake_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(u: u64) -> Self {
                Self(u)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake_id!(GuildId);
snowflake_id!(UserId);
snowflake_id!(ChannelId);

/// Discord serializes snowflakes as JSON strings; accept both forms.
pub fn parse_snowflake(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_accepts_string_and_number() {
        assert_eq!(parse_snowflake(&serde_json::json!("1234")), Some(1234));
        assert_eq!(parse_snowflake(&serde_json::json!(42)), Some(42));
        assert_eq!(parse_snowflake(&serde_json::json!(null)), None);
        assert_eq!(parse_snowflake(&serde_json::json!("abc")), None);
    }

    #[test]
    fn test_ids_display_and_parse() {
        let id: GuildId = "987".parse().unwrap();
        assert_eq!(id, GuildId(987));
        assert_eq!(id.to_string(), "987");
    }
}
