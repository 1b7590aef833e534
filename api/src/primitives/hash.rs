use serde::Serialize;

/// Macro to implement `Deserialize`, `PartialEq`, and `as_str()` for a SHA2-family hash.
macro_rules! impl_common_sha2 {
    ($name:ident, $length:expr) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                if s.len() != $length {
                    return Err(serde::de::Error::custom(format!(
                        "Invalid length {}, expected {}",
                        s.len(),
                        $length
                    )));
                }
                if !s.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(serde::de::Error::custom("Expected hexadecimal string"));
                }
                Ok($name(s))
            }
        }

    };
}

/// The SHA384 checksum is a 96 character hexadecimal string, used for a
/// COSI archive's `ImageFile.sha384` field (the digest of a partition blob
/// as written to the tar).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha384Hash(String);
impl_common_sha2!(Sha384Hash, 96);
