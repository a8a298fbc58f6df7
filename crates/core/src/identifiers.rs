//! Validated identifier types.
//!
//! Every identifier comes in a borrowed, unsized form (`&RoomId`) and an
//! owned form (`OwnedRoomId`), so maps can be keyed by the owned type and
//! looked up with the borrowed one. Construction always validates; once an
//! identifier exists its well-formedness can be relied upon.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// The maximum identifier length in bytes, shared by all sigil identifiers.
const MAX_ID_BYTES: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier is missing the `{0}` sigil")]
    MissingSigil(char),
    #[error("identifier is missing the server name part")]
    MissingServerName,
    #[error("invalid server name")]
    InvalidServerName,
    #[error("identifier exceeds 255 bytes")]
    MaximumLengthExceeded,
    #[error("invalid characters in identifier")]
    InvalidCharacters,
    #[error("unknown signing key algorithm")]
    UnknownAlgorithm,
}

macro_rules! id_type {
    (
        $(#[$meta:meta])*
        $id:ident, $owned:ident, $validate:path
    ) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id(str);

        impl $id {
            /// Validates `s` and borrows it as this identifier type.
            pub fn parse(s: &str) -> Result<&Self, IdParseError> {
                $validate(s)?;
                Ok(unsafe { Self::from_unchecked(s) })
            }

            /// Caller must have validated `s`.
            pub(crate) const unsafe fn from_unchecked(s: &str) -> &Self {
                unsafe { &*(s as *const str as *const Self) }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        #[doc = concat!("Owned variant of [`", stringify!($id), "`].")]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $owned(Box<$id>);

        impl $owned {
            fn from_box(s: Box<str>) -> Self {
                Self(unsafe { Box::from_raw(Box::into_raw(s) as *mut $id) })
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl Clone for $owned {
            fn clone(&self) -> Self {
                Self::from_box(self.0.as_str().into())
            }
        }

        impl Deref for $owned {
            type Target = $id;

            fn deref(&self) -> &$id {
                &self.0
            }
        }

        impl Borrow<$id> for $owned {
            fn borrow(&self) -> &$id {
                &self.0
            }
        }

        impl AsRef<$id> for $owned {
            fn as_ref(&self) -> &$id {
                &self.0
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $owned {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl ToOwned for $id {
            type Owned = $owned;

            fn to_owned(&self) -> $owned {
                $owned::from_box(self.0.into())
            }
        }

        impl From<&$id> for $owned {
            fn from(id: &$id) -> Self {
                id.to_owned()
            }
        }

        impl From<$owned> for String {
            fn from(id: $owned) -> Self {
                id.as_str().to_owned()
            }
        }

        impl FromStr for $owned {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($id::parse(s)?.to_owned())
            }
        }

        impl TryFrom<&str> for $owned {
            type Error = IdParseError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Ok($id::parse(s)?.to_owned())
            }
        }

        impl TryFrom<String> for $owned {
            type Error = IdParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                $validate(&s)?;
                Ok(Self::from_box(s.into_boxed_str()))
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Display for $owned {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", &self.0)
            }
        }

        impl fmt::Debug for $owned {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.as_str())
            }
        }

        impl PartialEq<str> for $id {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $id {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl PartialEq<&str> for $owned {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl PartialEq<$owned> for $id {
            fn eq(&self, other: &$owned) -> bool {
                self == other.deref()
            }
        }

        impl PartialEq<$id> for $owned {
            fn eq(&self, other: &$id) -> bool {
                self.deref() == other
            }
        }

        impl PartialEq<&$id> for $owned {
            fn eq(&self, other: &&$id) -> bool {
                self.deref() == *other
            }
        }

        impl PartialEq<$owned> for &$id {
            fn eq(&self, other: &$owned) -> bool {
                *self == other.deref()
            }
        }

        impl Serialize for $id {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl Serialize for $owned {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $owned {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::try_from(s).map_err(de::Error::custom)
            }
        }
    };
}

id_type! {
    /// The name of a homeserver: a hostname with an optional port, or an IP
    /// literal.
    ServerName, OwnedServerName, validate_server_name
}

id_type! {
    /// A user identifier, `@localpart:server.name`.
    UserId, OwnedUserId, validate_user_id
}

id_type! {
    /// A room identifier, `!opaque:server.name`.
    RoomId, OwnedRoomId, validate_room_id
}

id_type! {
    /// An event identifier.
    ///
    /// In the room versions this server speaks the identifier is derived
    /// from the event's reference hash: `$` followed by unpadded url-safe
    /// Base64.
    EventId, OwnedEventId, validate_event_id
}

id_type! {
    /// An opaque transaction identifier, scoped per (origin, destination)
    /// on federation and per (user, device) on the client API.
    TransactionId, OwnedTransactionId, validate_opaque_id
}

id_type! {
    /// An opaque device identifier.
    DeviceId, OwnedDeviceId, validate_opaque_id
}

id_type! {
    /// A server signing key identifier, `ed25519:<version>`.
    ServerSigningKeyId, OwnedServerSigningKeyId, validate_signing_key_id
}

impl ServerName {
    /// The hostname part, without any port.
    pub fn host(&self) -> &str {
        let s = self.as_str();
        if let Some(end) = s.find(']') {
            // IPv6 literal
            &s[..=end]
        } else {
            match s.rfind(':') {
                Some(idx) => &s[..idx],
                None => s,
            }
        }
    }

    /// The explicit port, if one is present.
    pub fn port(&self) -> Option<u16> {
        let s = self.as_str();
        let rest = match s.find(']') {
            Some(end) => &s[end + 1..],
            None => s,
        };
        rest.rfind(':').and_then(|idx| rest[idx + 1..].parse().ok())
    }

    pub fn is_ip_literal(&self) -> bool {
        let host = self.host();
        host.starts_with('[') || host.parse::<std::net::Ipv4Addr>().is_ok()
    }
}

impl UserId {
    pub fn localpart(&self) -> &str {
        let s = self.as_str();
        let colon = s.find(':').expect("validated user id contains a colon");
        &s[1..colon]
    }

    pub fn server_name(&self) -> &ServerName {
        let s = self.as_str();
        let colon = s.find(':').expect("validated user id contains a colon");
        unsafe { ServerName::from_unchecked(&s[colon + 1..]) }
    }

    /// Builds a user id from its parts, validating the result.
    pub fn parse_with_server_name(
        localpart: &str,
        server_name: &ServerName,
    ) -> Result<OwnedUserId, IdParseError> {
        OwnedUserId::try_from(format!("@{localpart}:{server_name}"))
    }
}

impl RoomId {
    pub fn server_name(&self) -> Result<&ServerName, IdParseError> {
        let s = self.as_str();
        let colon = s.find(':').ok_or(IdParseError::MissingServerName)?;
        ServerName::parse(&s[colon + 1..])
    }

    /// A fresh room id on the given server, from 18 random alphanumerics.
    pub fn new(server_name: &ServerName) -> OwnedRoomId {
        let localpart = crate::serde::random_string(18);
        OwnedRoomId::try_from(format!("!{localpart}:{server_name}"))
            .expect("generated room id is valid")
    }
}

impl ServerSigningKeyId {
    pub fn algorithm(&self) -> &str {
        let s = self.as_str();
        &s[..s.find(':').expect("validated key id contains a colon")]
    }

    pub fn version(&self) -> &str {
        let s = self.as_str();
        &s[s.find(':').expect("validated key id contains a colon") + 1..]
    }

    /// Builds the `ed25519:<version>` identifier for a key version.
    pub fn from_version(version: &str) -> Result<OwnedServerSigningKeyId, IdParseError> {
        OwnedServerSigningKeyId::try_from(format!("ed25519:{version}"))
    }
}

impl TransactionId {
    /// A fresh opaque transaction id.
    pub fn new() -> OwnedTransactionId {
        OwnedTransactionId::try_from(crate::serde::random_string(16))
            .expect("generated transaction id is valid")
    }
}

fn validate_server_name(s: &str) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    if s.len() > MAX_ID_BYTES {
        return Err(IdParseError::MaximumLengthExceeded);
    }

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        // IPv6 literal
        let end = rest.find(']').ok_or(IdParseError::InvalidServerName)?;
        let addr = &rest[..end];
        if addr.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(IdParseError::InvalidServerName);
        }
        (None, rest[end + 1..].strip_prefix(':'))
    } else {
        match s.rfind(':') {
            Some(idx) => (Some(&s[..idx]), Some(&s[idx + 1..])),
            None => (Some(s), None),
        }
    };

    if let Some(host) = host {
        if host.is_empty()
            || !host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
        {
            return Err(IdParseError::InvalidServerName);
        }
    }
    if let Some(port) = port {
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(IdParseError::InvalidServerName);
        }
    }
    Ok(())
}

fn validate_sigil_with_server_name(s: &str, sigil: char) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    if !s.starts_with(sigil) {
        return Err(IdParseError::MissingSigil(sigil));
    }
    if s.len() > MAX_ID_BYTES {
        return Err(IdParseError::MaximumLengthExceeded);
    }
    let colon = s.find(':').ok_or(IdParseError::MissingServerName)?;
    if colon == 1 {
        return Err(IdParseError::InvalidCharacters);
    }
    validate_server_name(&s[colon + 1..]).map_err(|_| IdParseError::InvalidServerName)
}

fn validate_user_id(s: &str) -> Result<(), IdParseError> {
    validate_sigil_with_server_name(s, '@')
}

fn validate_room_id(s: &str) -> Result<(), IdParseError> {
    validate_sigil_with_server_name(s, '!')
}

fn validate_event_id(s: &str) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    if !s.starts_with('$') {
        return Err(IdParseError::MissingSigil('$'));
    }
    if s.len() > MAX_ID_BYTES {
        return Err(IdParseError::MaximumLengthExceeded);
    }
    if s.len() == 1 {
        return Err(IdParseError::InvalidCharacters);
    }
    Ok(())
}

fn validate_opaque_id(s: &str) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    if s.len() > MAX_ID_BYTES {
        return Err(IdParseError::MaximumLengthExceeded);
    }
    Ok(())
}

fn validate_signing_key_id(s: &str) -> Result<(), IdParseError> {
    let colon = s.find(':').ok_or(IdParseError::InvalidCharacters)?;
    let (algorithm, version) = (&s[..colon], &s[colon + 1..]);
    if algorithm != "ed25519" {
        return Err(IdParseError::UnknownAlgorithm);
    }
    if version.is_empty()
        || !version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(IdParseError::InvalidCharacters);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_user_id() {
        let user = UserId::parse("@alice:example.com").unwrap();
        assert_eq!(user.localpart(), "alice");
        assert_eq!(user.server_name().as_str(), "example.com");
    }

    #[test]
    fn user_id_requires_sigil_and_server() {
        assert_eq!(
            UserId::parse("alice:example.com").unwrap_err(),
            IdParseError::MissingSigil('@')
        );
        assert_eq!(
            UserId::parse("@alice").unwrap_err(),
            IdParseError::MissingServerName
        );
    }

    #[test]
    fn server_name_ports_and_literals() {
        let name = ServerName::parse("example.com:8448").unwrap();
        assert_eq!(name.host(), "example.com");
        assert_eq!(name.port(), Some(8448));

        let plain = ServerName::parse("example.com").unwrap();
        assert_eq!(plain.port(), None);
        assert!(!plain.is_ip_literal());

        let v4 = ServerName::parse("198.51.100.5").unwrap();
        assert!(v4.is_ip_literal());

        let v6 = ServerName::parse("[2001:db8::1]:8448").unwrap();
        assert!(v6.is_ip_literal());
        assert_eq!(v6.port(), Some(8448));

        assert!(ServerName::parse("exa mple.com").is_err());
        assert!(ServerName::parse("example.com:http").is_err());
    }

    #[test]
    fn owned_and_borrowed_interoperate() {
        let owned: OwnedRoomId = "!abc:example.com".try_into().unwrap();
        let borrowed = RoomId::parse("!abc:example.com").unwrap();
        assert_eq!(owned, *borrowed);
        assert_eq!(owned.server_name().unwrap().as_str(), "example.com");

        let mut map = std::collections::HashMap::new();
        map.insert(owned.clone(), 1);
        assert_eq!(map.get(borrowed), Some(&1));
    }

    #[test]
    fn event_id_format() {
        assert!(EventId::parse("$abcDEF123-_").is_ok());
        assert!(EventId::parse("$legacy:example.com").is_ok());
        assert_eq!(
            EventId::parse("abc").unwrap_err(),
            IdParseError::MissingSigil('$')
        );
    }

    #[test]
    fn signing_key_id_parts() {
        let key = ServerSigningKeyId::parse("ed25519:a_1b2").unwrap();
        assert_eq!(key.algorithm(), "ed25519");
        assert_eq!(key.version(), "a_1b2");
        assert!(ServerSigningKeyId::parse("rsa:abc").is_err());
        assert!(ServerSigningKeyId::parse("ed25519:bad!ver").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let user: OwnedUserId = "@bob:example.org".try_into().unwrap();
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"@bob:example.org\"");
        let back: OwnedUserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
        assert!(serde_json::from_str::<OwnedUserId>("\"nope\"").is_err());
    }
}
