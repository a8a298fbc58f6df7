//! The `X-Matrix` authorization scheme carried on every federation request.

use std::str;

use salvo::http::HeaderValue;
use salvo::http::headers::authorization::Credentials;

use crate::identifiers::{OwnedServerName, OwnedServerSigningKeyId};

/// The parsed fields of an `Authorization: X-Matrix ...` header:
/// `origin="..",destination="..",key="ed25519:..",sig=".."`.
#[derive(Clone, Debug)]
pub struct XMatrix {
    pub origin: OwnedServerName,
    pub destination: Option<OwnedServerName>,
    pub key: OwnedServerSigningKeyId,
    pub sig: String,
}

impl XMatrix {
    pub fn new(
        origin: OwnedServerName,
        destination: OwnedServerName,
        key: OwnedServerSigningKeyId,
        sig: String,
    ) -> Self {
        Self {
            origin,
            destination: Some(destination),
            key,
            sig,
        }
    }

    /// Parses the parameter list after the `X-Matrix ` scheme prefix.
    pub fn parse(parameters: &str) -> Option<Self> {
        let mut origin = None;
        let mut destination = None;
        let mut key = None;
        let mut sig = None;

        for entry in parameters.split_terminator(',') {
            let (name, value) = entry.trim().split_once('=')?;

            // Quoting is inconsistent in the wild; accept either form for
            // every field.
            let value = value
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .unwrap_or(value);

            match name {
                "origin" => origin = OwnedServerName::try_from(value).ok(),
                "destination" => destination = OwnedServerName::try_from(value).ok(),
                "key" => key = OwnedServerSigningKeyId::try_from(value).ok(),
                "sig" => sig = Some(value.to_owned()),
                _ => {
                    tracing::debug!("unexpected field `{name}` in X-Matrix header");
                }
            }
        }

        Some(Self {
            origin: origin?,
            destination,
            key: key?,
            sig: sig?,
        })
    }

    fn header_value(&self) -> String {
        let mut value = format!(
            "X-Matrix origin=\"{}\",key=\"{}\",sig=\"{}\"",
            self.origin, self.key, self.sig
        );
        if let Some(destination) = &self.destination {
            value.push_str(&format!(",destination=\"{destination}\""));
        }
        value
    }
}

impl Credentials for XMatrix {
    const SCHEME: &'static str = "X-Matrix";

    fn decode(value: &HeaderValue) -> Option<Self> {
        let value = str::from_utf8(value.as_bytes()).ok()?;
        let parameters = value.strip_prefix("X-Matrix")?.trim_start();
        Self::parse(parameters)
    }

    fn encode(&self) -> HeaderValue {
        HeaderValue::from_str(&self.header_value())
            .expect("X-Matrix header values contain no invalid characters")
    }
}

#[cfg(test)]
mod tests {
    use super::XMatrix;

    #[test]
    fn parse_quoted_and_bare() {
        let parsed = XMatrix::parse(
            r#"origin="s1.example",destination="s2.example",key="ed25519:k1",sig="c2ln""#,
        )
        .unwrap();
        assert_eq!(parsed.origin.as_str(), "s1.example");
        assert_eq!(parsed.destination.as_ref().unwrap().as_str(), "s2.example");
        assert_eq!(parsed.key.as_str(), "ed25519:k1");
        assert_eq!(parsed.sig, "c2ln");

        let bare = XMatrix::parse("origin=s1.example,key=ed25519:k1,sig=c2ln").unwrap();
        assert!(bare.destination.is_none());
        assert_eq!(bare.origin.as_str(), "s1.example");
    }

    #[test]
    fn rejects_incomplete_headers() {
        assert!(XMatrix::parse("origin=s1.example,sig=abc").is_none());
        assert!(XMatrix::parse("key=ed25519:k1,sig=abc").is_none());
    }

    #[test]
    fn encode_round_trips() {
        use salvo::http::headers::authorization::Credentials;

        let header = XMatrix::new(
            "s1.example".try_into().unwrap(),
            "s2.example".try_into().unwrap(),
            "ed25519:k1".try_into().unwrap(),
            "c2ln".to_owned(),
        );
        let value = header.encode();
        let decoded = XMatrix::decode(&value).unwrap();
        assert_eq!(decoded.origin, header.origin);
        assert_eq!(decoded.sig, header.sig);
    }
}
