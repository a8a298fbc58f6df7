//! Serde adapter for the per-PDU result map in transaction responses.
//!
//! On the wire a successful PDU maps to `{}` and a failed one to
//! `{"error": "..."}`.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serializer};

use crate::identifiers::OwnedEventId;

#[derive(Deserialize, serde::Serialize)]
struct WrappedError {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn serialize<S: Serializer>(
    response: &BTreeMap<OwnedEventId, Result<(), String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(response.len()))?;
    for (key, value) in response {
        let wrapped = WrappedError {
            error: value.as_ref().err().cloned(),
        };
        map.serialize_entry(key, &wrapped)?;
    }
    map.end()
}

pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<OwnedEventId, Result<(), String>>, D::Error> {
    let map = BTreeMap::<OwnedEventId, WrappedError>::deserialize(deserializer)?;
    Ok(map
        .into_iter()
        .map(|(key, wrapped)| {
            let result = match wrapped.error {
                None => Ok(()),
                Some(error) => Err(error),
            };
            (key, result)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use crate::identifiers::OwnedEventId;

    #[derive(Serialize, Deserialize)]
    struct Response {
        #[serde(with = "super")]
        pdus: BTreeMap<OwnedEventId, Result<(), String>>,
    }

    #[test]
    fn wire_format() {
        let mut pdus = BTreeMap::new();
        pdus.insert(OwnedEventId::try_from("$a").unwrap(), Ok(()));
        pdus.insert(
            OwnedEventId::try_from("$b").unwrap(),
            Err("bad hash".to_owned()),
        );

        let json = serde_json::to_string(&Response { pdus }).unwrap();
        assert_eq!(json, r#"{"pdus":{"$a":{},"$b":{"error":"bad hash"}}}"#);

        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pdus.len(), 2);
        assert!(back.pdus[crate::identifiers::EventId::parse("$a").unwrap()].is_ok());
        assert_eq!(
            back.pdus[crate::identifiers::EventId::parse("$b").unwrap()]
                .as_ref()
                .unwrap_err(),
            "bad hash"
        );
    }
}
